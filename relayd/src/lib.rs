//! `relayd`: the embedding application's entry point (spec.md §1's
//! "opaque box handler registered via the command id" and "group
//! router", here wired up into one process-wide builder).
//!
//! A binary depending on this crate calls [`Relayd::new`], registers a
//! group router and per-command handlers, and calls `.run()` once, from
//! `main()`, with no branching on role: the very same binary is
//! re-exec'd by the master as the proxy and as each worker (see
//! `relayd_protocol::env`), and `.run()` reads `CHILD_PROCESS_ENV_KEY`
//! to decide which of the three it is this time.

use relayd_core::signals::WorkerSignals;
use relayd_core::{Config, GroupRouter, Handler, HandlerRegistry, TaskFrame};
use relayd_protocol::env::{ChildProcessEnv, ProcKind};
use relayd_protocol::{BoxFrame, ControlFrame, Frame};
use std::collections::HashSet;
use std::time::Duration;

/// Builder for one `relayd`-based application. `F` is the wire frame
/// type; most applications can use the default [`BoxFrame`].
pub struct Relayd<F: Frame = BoxFrame> {
    config: Config,
    group_router: Option<GroupRouter<F>>,
    handlers: HandlerRegistry<F>,
    registered_cmds: HashSet<i32>,
    duplicate_cmd: Option<i32>,
}

impl Relayd<BoxFrame> {
    pub fn new(config: Config) -> Self {
        Relayd {
            config,
            group_router: None,
            handlers: HandlerRegistry::new(),
            registered_cmds: HashSet::new(),
            duplicate_cmd: None,
        }
    }
}

impl<F> Relayd<F>
where
    F: Frame + TaskFrame + ControlFrame,
{
    /// Registers the pure function routing each client frame to a
    /// `group_id` (spec.md §9: sees the full parsed frame, cmd and body).
    pub fn group_router<R>(mut self, router: R) -> Self
    where
        R: Fn(&F) -> u32 + Send + Sync + 'static,
    {
        self.group_router = Some(std::sync::Arc::new(router));
        self
    }

    /// Registers the handler a worker process invokes for client
    /// frames whose `cmd` matches. Registering the same `cmd` twice is
    /// a fatal configuration error, reported when `.run()` is called
    /// (spec.md §6: "Exit codes... non-zero only on configuration
    /// errors (duplicate handler commands, missing group router)").
    pub fn handle<H>(mut self, cmd: i32, handler: H) -> Self
    where
        H: Handler<F> + 'static,
    {
        if !self.registered_cmds.insert(cmd) {
            self.duplicate_cmd.get_or_insert(cmd);
        }
        self.handlers.register(cmd, Box::new(handler));
        self
    }

    /// Blocking. Reads `CHILD_PROCESS_ENV_KEY` to determine this
    /// process's role and runs the matching loop: master (absent),
    /// proxy, or worker.
    pub fn run(self) -> Result<(), String> {
        if let Some(cmd) = self.duplicate_cmd {
            return Err(format!("duplicate handler registration for cmd {cmd}"));
        }
        // Checked here, before dispatching on role, so a missing router
        // fails the master itself (spec.md §6: "Master exits... non-zero
        // only on configuration errors") rather than only the proxy child
        // it would otherwise spawn and then have to keep respawning.
        let group_router = self
            .group_router
            .ok_or_else(|| "missing group router".to_string())?;

        match ChildProcessEnv::from_env() {
            None => relayd_core::master::run::<F>(self.config),
            Some(env) => match env.kind {
                ProcKind::Proxy => relayd_core::proxy::run(self.config, group_router),
                ProcKind::Worker => {
                    let group_id = env
                        .group_id
                        .ok_or_else(|| "worker env missing group_id".to_string())?;
                    let address = self.config.worker_address(group_id);

                    let signals = WorkerSignals::new();
                    signals.install();

                    let job_timeout = self.config.job_timeout_ms.map(Duration::from_millis);
                    relayd_core::worker_proc::run(&address, self.handlers, signals, job_timeout)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(req: &relayd_core::Request<BoxFrame>) -> Result<BoxFrame, String> {
        Ok(req.frame().with_body(req.body().to_vec()))
    }

    #[test]
    fn duplicate_handler_registration_is_rejected_at_run() {
        let app = Relayd::new(Config::new("127.0.0.1", 0))
            .group_router(|_f: &BoxFrame| 1)
            .handle(1, echo)
            .handle(1, echo);

        // `.run()` would otherwise block forever trying to spawn a
        // master process tree; duplicate detection must short-circuit
        // before any of that.
        let err = app.run().unwrap_err();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn missing_group_router_is_rejected_at_run() {
        let app = Relayd::new(Config::new("127.0.0.1", 0)).handle(1, echo);

        let err = app.run().unwrap_err();
        assert!(err.contains("group router"));
    }
}
