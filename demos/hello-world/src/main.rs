//! Smallest possible `relayd` application: one group, one worker, a
//! handler that stamps every frame's `ret` to 10 and echoes its body
//! back unchanged.
//!
//! Run it three times with `RELAYD_CHILD_PROCESS` unset (master), then
//! send a `cmd=1` frame to `127.0.0.1:7878` and expect `ret=10` back.

use relayd::Relayd;
use relayd_core::{Config, Request};
use relayd_protocol::BoxFrame;

fn main() {
    env_logger::init();

    let config = Config::new("127.0.0.1", 7878).with_group(1, 1);

    let app = Relayd::new(config)
        .group_router(|_frame: &BoxFrame| 1)
        .handle(1, |req: &Request<BoxFrame>| Ok(req.frame().with_ret(10)));

    if let Err(e) = app.run() {
        log::error!("relayd exited with error: {e}");
        std::process::exit(1);
    }
}
