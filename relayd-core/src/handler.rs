//! The worker-side contract: application handler code and the group
//! router are external collaborators (spec.md §1), registered with
//! these traits.

use relayd_protocol::Frame;
use std::sync::Arc;

/// A view over a client's raw frame, as seen by a worker-side handler.
pub struct Request<'a, F: Frame> {
    frame: &'a F,
    client_ip_num: u32,
}

impl<'a, F: Frame> Request<'a, F> {
    pub fn new(frame: &'a F, client_ip_num: u32) -> Self {
        Request { frame, client_ip_num }
    }

    pub fn cmd(&self) -> i32 {
        self.frame.cmd()
    }

    pub fn body(&self) -> &[u8] {
        self.frame.body()
    }

    pub fn client_ip_num(&self) -> u32 {
        self.client_ip_num
    }

    /// The original client frame, in case a handler wants more than
    /// `cmd`/`body` (e.g. to re-pack it for the response).
    pub fn frame(&self) -> &F {
        self.frame
    }
}

/// Application handler code, registered per command id (spec.md §1:
/// "opaque box handler registered via the command id").
pub trait Handler<F: Frame>: Send {
    fn handle(&mut self, req: &Request<F>) -> Result<F, String>;
}

impl<F: Frame, T> Handler<F> for T
where
    T: FnMut(&Request<F>) -> Result<F, String> + Send,
{
    fn handle(&mut self, req: &Request<F>) -> Result<F, String> {
        self(req)
    }
}

/// `group_router(box)`: a pure function from a frame to a group id
/// (spec.md §9 open question: resolved as seeing cmd + body, i.e. the
/// full parsed frame).
pub type GroupRouter<F> = Arc<dyn Fn(&F) -> u32 + Send + Sync>;
