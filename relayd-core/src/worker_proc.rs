//! The worker process's run loop (spec.md §4.3, §5).
//!
//! Adapted from `mptc::worker::Worker::run()`'s shape (poll for
//! shutdown, pull one unit of work, process it, report state) but
//! driven over a real OS connection to the proxy's per-group IPC
//! socket rather than an in-process `mpsc` channel, since a worker here
//! is its own process (spec.md §1: "crash isolation... the failure of
//! one worker does not affect its siblings").

use crate::handler::{Handler, Request};
use crate::io::{is_timeout, FrameReader};
use crate::signals::WorkerSignals;
use crate::task::{decode_assign_body, TaskFrame};
use relayd_protocol::constants::{CMD_WORKER_TASK_ASSIGN, RET_WORKER_ERROR};
use relayd_protocol::Frame;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// How long a read blocks before the loop wakes to re-check
/// `WorkerSignals` when no task has arrived.
const POLL_INTERVAL_MS: u64 = 1_000;

/// Registered application handlers, keyed by the client-frame command id
/// they serve (spec.md §1: "opaque box handler registered via the
/// command id").
pub struct HandlerRegistry<F: Frame> {
    handlers: HashMap<i32, Box<dyn Handler<F>>>,
}

impl<F: Frame> Default for HandlerRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Frame> HandlerRegistry<F> {
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, cmd: i32, handler: Box<dyn Handler<F>>) {
        self.handlers.insert(cmd, handler);
    }

    fn dispatch(&mut self, req: &Request<F>) -> Result<F, String> {
        match self.handlers.get_mut(&req.cmd()) {
            Some(h) => h.handle(req),
            None => Err(format!("no handler registered for cmd {}", req.cmd())),
        }
    }
}

/// Connects to `worker_address`, then runs the read-task/invoke-handler/
/// write-response loop until told to stop.
///
/// `job_timeout` bounds a single handler invocation: if set and exceeded,
/// the worker process exits immediately (spec.md §5: "a worker that
/// exceeds its job timeout self-terminates" -- there is no mid-handler
/// preemption in-process, so the invocation runs on a helper thread and
/// the main loop simply stops waiting for it).
pub fn run<F>(
    worker_address: &Path,
    mut registry: HandlerRegistry<F>,
    signals: WorkerSignals,
    job_timeout: Option<Duration>,
) -> Result<(), String>
where
    F: Frame + TaskFrame,
{
    let stream = UnixStream::connect(worker_address)
        .map_err(|e| format!("cannot connect to {}: {e}", worker_address.display()))?;
    stream
        .set_read_timeout(Some(Duration::from_millis(POLL_INTERVAL_MS)))
        .map_err(|e| format!("cannot set read timeout: {e}"))?;

    let mut writer = stream.try_clone().map_err(|e| e.to_string())?;
    let mut reader = FrameReader::new(stream);

    log::info!("worker connected to {}", worker_address.display());

    loop {
        if signals.interrupted() {
            log::info!("worker interrupted, exiting immediately");
            return Ok(());
        }

        let assign: F = match reader.next_frame() {
            Ok(Some(f)) => f,
            Ok(None) => {
                log::info!("proxy closed worker connection, exiting");
                return Ok(());
            }
            Err(e) if is_timeout(&e) => {
                if !signals.enabled() {
                    log::info!("worker draining (no task in flight), exiting");
                    return Ok(());
                }
                continue;
            }
            Err(e) => return Err(format!("error reading from proxy: {e}")),
        };

        if assign.cmd() != CMD_WORKER_TASK_ASSIGN {
            log::warn!("ignoring frame with unexpected cmd {}", assign.cmd());
            continue;
        }

        let (returned_registry, response) = handle_one(registry, &assign, job_timeout);
        registry = returned_registry;

        if let Err(e) = writer.write_all(&response.encode()) {
            return Err(format!("error writing response to proxy: {e}"));
        }

        if !signals.enabled() {
            log::info!("worker finished in-flight task and is draining, exiting");
            return Ok(());
        }
    }
}

fn handle_one<F>(
    registry: HandlerRegistry<F>,
    assign: &F,
    job_timeout: Option<Duration>,
) -> (HandlerRegistry<F>, F)
where
    F: Frame + TaskFrame,
{
    let (client_ip_num, raw) = match decode_assign_body(assign.body()) {
        Some(v) => v,
        None => {
            log::error!("malformed assign body: too short");
            return (registry, assign.with_ret(RET_WORKER_ERROR));
        }
    };

    let client_frame = match F::parse(raw) {
        relayd_protocol::Parsed::Complete(f, consumed) if consumed == raw.len() => f,
        _ => {
            log::error!("assign body does not contain exactly one client frame");
            return (registry, assign.with_ret(RET_WORKER_ERROR));
        }
    };

    match job_timeout {
        None => run_handler(registry, client_frame, client_ip_num),
        Some(timeout) => run_handler_with_timeout(registry, client_frame, client_ip_num, timeout),
    }
}

fn run_handler<F: Frame>(
    mut registry: HandlerRegistry<F>,
    frame: F,
    client_ip_num: u32,
) -> (HandlerRegistry<F>, F) {
    let req = Request::new(&frame, client_ip_num);
    let result = registry.dispatch(&req);
    let resp = match result {
        Ok(resp) => resp,
        Err(e) => {
            log::error!("handler error: {e}");
            frame.with_ret(RET_WORKER_ERROR).with_body(Vec::new())
        }
    };
    (registry, resp)
}

/// Runs the handler on a helper thread so the main loop can give up
/// waiting after `timeout` and self-terminate the whole process. The
/// registry and frame are moved onto that thread (both `Send`, since
/// `Handler: Send` and `Frame: Send`); if the handler returns in time
/// the thread hands them back over the channel, otherwise the worker
/// process exits without waiting for the thread to ever finish -- there
/// is no safe way to preempt a running handler in place.
fn run_handler_with_timeout<F>(
    registry: HandlerRegistry<F>,
    frame: F,
    client_ip_num: u32,
    timeout: Duration,
) -> (HandlerRegistry<F>, F)
where
    F: Frame,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let (registry, resp) = run_handler(registry, frame, client_ip_num);
        let _ = tx.send((registry, resp));
    });

    match rx.recv_timeout(timeout) {
        Ok(pair) => pair,
        Err(_) => {
            log::error!("handler exceeded job timeout of {timeout:?}; worker exiting");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use relayd_protocol::BoxFrame;

    struct Echo;
    impl Handler<BoxFrame> for Echo {
        fn handle(&mut self, req: &Request<BoxFrame>) -> Result<BoxFrame, String> {
            Ok(req.frame().with_body(req.body().to_vec()))
        }
    }

    #[test]
    fn handle_one_dispatches_to_registered_cmd() {
        let mut registry: HandlerRegistry<BoxFrame> = HandlerRegistry::new();
        registry.register(5, Box::new(Echo));

        let task: Task<BoxFrame> = Task::new(0x01020304, {
            let client_frame = BoxFrame::request(5, b"ping".to_vec());
            client_frame.encode()
        });
        let assign = task.to_assign_frame();

        let (_registry, resp) = handle_one(registry, &assign, None);
        assert_eq!(resp.body(), b"ping");
        assert_eq!(resp.ret(), 0);
    }

    #[test]
    fn handle_one_reports_error_for_unregistered_cmd() {
        let registry: HandlerRegistry<BoxFrame> = HandlerRegistry::new();
        let task: Task<BoxFrame> = Task::new(0, {
            let client_frame = BoxFrame::request(99, b"x".to_vec());
            client_frame.encode()
        });
        let assign = task.to_assign_frame();

        let (_registry, resp) = handle_one(registry, &assign, None);
        assert_eq!(resp.ret(), RET_WORKER_ERROR);
    }

    #[test]
    fn handle_one_rejects_malformed_assign_body() {
        let registry: HandlerRegistry<BoxFrame> = HandlerRegistry::new();
        let assign = BoxFrame::request(CMD_WORKER_TASK_ASSIGN, vec![1, 2]);
        let (_registry, resp) = handle_one(registry, &assign, None);
        assert_eq!(resp.ret(), RET_WORKER_ERROR);
    }

    #[test]
    fn handle_one_with_timeout_returns_registry_for_reuse() {
        let mut registry: HandlerRegistry<BoxFrame> = HandlerRegistry::new();
        registry.register(5, Box::new(Echo));

        let task: Task<BoxFrame> = Task::new(0, {
            let client_frame = BoxFrame::request(5, b"ping".to_vec());
            client_frame.encode()
        });
        let assign = task.to_assign_frame();

        let (registry, resp) =
            handle_one(registry, &assign, Some(Duration::from_secs(1)));
        assert_eq!(resp.body(), b"ping");

        // The registry comes back usable for the next task.
        let (_registry, resp2) = handle_one(registry, &assign, None);
        assert_eq!(resp2.body(), b"ping");
    }
}
