//! `Task` / `TaskContainer` (spec.md §3, §9).

use relayd_protocol::{constants::CMD_WORKER_TASK_ASSIGN, Frame};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Instant;

/// Identifies a client connection in the proxy's connection registry.
/// Deliberately just an id, not a handle: per spec.md §9, a
/// `TaskContainer` must not keep the client connection alive.
pub type ConnId = u64;

/// A unit of work headed to a worker, wrapping the raw client frame.
#[derive(Debug, Clone)]
pub struct Task<F: Frame> {
    pub client_ip_num: u32,
    pub body: Vec<u8>,
    _frame: std::marker::PhantomData<F>,
}

impl<F: Frame> Task<F> {
    pub fn new(client_ip_num: u32, raw_client_frame: Vec<u8>) -> Self {
        Task {
            client_ip_num,
            body: raw_client_frame,
            _frame: std::marker::PhantomData,
        }
    }

    /// The frame assigned to a worker: `cmd = CMD_WORKER_TASK_ASSIGN`,
    /// body is the client's ip (4 bytes, big-endian) followed by the raw
    /// bytes of the originating client frame, so the worker can build a
    /// `Request` without the proxy needing a second round trip.
    pub fn to_assign_frame(&self) -> F
    where
        F: TaskFrame,
    {
        F::for_assign(encode_assign_body(self.client_ip_num, &self.body))
    }
}

fn encode_assign_body(client_ip_num: u32, raw_client_frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + raw_client_frame.len());
    out.extend_from_slice(&client_ip_num.to_be_bytes());
    out.extend_from_slice(raw_client_frame);
    out
}

/// Inverse of `encode_assign_body`, used by the worker process to
/// recover the client's ip and raw frame bytes from an assign frame's body.
pub fn decode_assign_body(body: &[u8]) -> Option<(u32, &[u8])> {
    if body.len() < 4 {
        return None;
    }
    let ip = u32::from_be_bytes(body[0..4].try_into().ok()?);
    Some((ip, &body[4..]))
}

/// Lets a concrete `Frame` type be constructed as a worker-task-assign
/// message without `relayd-core` needing to know its constructor shape.
pub trait TaskFrame: Frame {
    fn for_assign(body: Vec<u8>) -> Self;
}

impl TaskFrame for relayd_protocol::BoxFrame {
    fn for_assign(body: Vec<u8>) -> Self {
        relayd_protocol::BoxFrame::request(CMD_WORKER_TASK_ASSIGN, body)
    }
}

/// A task plus enough bookkeeping to deliver its response (or drop it,
/// if the client is gone) and to measure job time.
pub struct TaskContainer<F: Frame> {
    pub task: Task<F>,
    pub client_conn_id: ConnId,
    pub enqueued_at: Instant,
}

impl<F: Frame> TaskContainer<F> {
    pub fn new(task: Task<F>, client_conn_id: ConnId) -> Self {
        TaskContainer {
            task,
            client_conn_id,
            enqueued_at: Instant::now(),
        }
    }
}

/// Ported from the original's `ip_str_to_int` helper.
pub fn ipv4_to_u32(addr: &str) -> Option<u32> {
    Ipv4Addr::from_str(addr).ok().map(u32::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayd_protocol::BoxFrame;

    #[test]
    fn assign_frame_carries_ip_and_raw_body_under_task_assign_cmd() {
        let task: Task<BoxFrame> = Task::new(0x7f000001, b"raw-client-bytes".to_vec());
        let frame = task.to_assign_frame();
        assert_eq!(frame.cmd(), CMD_WORKER_TASK_ASSIGN);

        let (ip, raw) = decode_assign_body(frame.body()).unwrap();
        assert_eq!(ip, 0x7f000001);
        assert_eq!(raw, b"raw-client-bytes");
    }

    #[test]
    fn decode_assign_body_rejects_short_input() {
        assert!(decode_assign_body(&[1, 2, 3]).is_none());
    }

    #[test]
    fn ipv4_parses_dotted_quad() {
        assert_eq!(ipv4_to_u32("127.0.0.1"), Some(0x7f000001));
        assert_eq!(ipv4_to_u32("not-an-ip"), None);
    }
}
