//! The master process (spec.md §4.1, §5).
//!
//! Owns the process tree: spawns the proxy and the worker pool by
//! re-exec'ing the current executable with `CHILD_PROCESS_ENV_KEY` set
//! (see [`relayd_protocol::env`]), keeps a control connection to the
//! proxy's master IPC endpoint to hear about reload completion and
//! admin-forwarded commands, and drives the graceful-stop/hot-reload
//! state machines. The monitor loop is modeled on
//! `mptc::server::Server::run`'s poll-then-housekeep shape, except the
//! "workers" under supervision here are child OS processes rather than
//! threads.

use crate::config::Config;
use crate::io::{write_frame, FrameReader};
use crate::signals::MasterSignals;
use relayd_protocol::admin::ChangePayload;
use relayd_protocol::constants::*;
use relayd_protocol::env::ChildProcessEnv;
use relayd_protocol::{ControlFrame, Frame};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Mirrors spec.md §4.1's `MasterState.reload_status`. Distinct from
/// `crate::reload::ReloadHelper`, which is the proxy's half of the same
/// handshake and tracks individual worker registrations rather than a
/// single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloadStatus {
    Stopped,
    Preparing,
    WorkersDone,
}

struct WorkerSlot {
    group_id: u32,
    child: Child,
}

/// What the control-connection reader thread hands back to the monitor
/// loop. The reader thread does no interpretation beyond "what command
/// is this"; all state mutation happens on the monitor loop's thread.
enum ControlEvent {
    ReplaceWorkersReady,
    Change { group_id: u32, count: usize },
    Reload,
    Stop,
    Disconnected,
}

/// A live connection to the proxy's master IPC endpoint: a writer half
/// held here, and a receiver fed by a background reader thread on the
/// other half (`UnixStream::try_clone` gives two handles to the same
/// socket, each independently readable/writable, so no locking is
/// needed between them).
struct Control {
    writer: UnixStream,
    events: mpsc::Receiver<ControlEvent>,
}

impl Control {
    fn connect<F: Frame>(path: &std::path::Path) -> std::io::Result<Self> {
        let writer = UnixStream::connect(path)?;
        let reader_stream = writer.try_clone()?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || run_control_reader::<F>(reader_stream, tx));
        Ok(Control { writer, events: rx })
    }

    fn send<F: Frame + ControlFrame>(&mut self, cmd: i32, body: Vec<u8>) {
        let frame = F::control(cmd, body);
        if let Err(e) = write_frame(&mut self.writer, &frame) {
            log::error!("error writing to proxy control connection: {e}");
        }
    }
}

fn run_control_reader<F: Frame>(stream: UnixStream, tx: mpsc::Sender<ControlEvent>) {
    let mut reader = FrameReader::new(stream);
    loop {
        let event = match reader.next_frame::<F>() {
            Ok(Some(frame)) => match decode_control_frame(&frame) {
                Some(event) => event,
                None => {
                    log::warn!("proxy sent unrecognized control cmd {}", frame.cmd());
                    continue;
                }
            },
            Ok(None) => ControlEvent::Disconnected,
            Err(e) => {
                log::error!("proxy control connection error: {e}");
                ControlEvent::Disconnected
            }
        };

        let stop = matches!(event, ControlEvent::Disconnected);
        if tx.send(event).is_err() || stop {
            return;
        }
    }
}

fn decode_control_frame<F: Frame>(frame: &F) -> Option<ControlEvent> {
    match frame.cmd() {
        CMD_MASTER_REPLACE_WORKERS => Some(ControlEvent::ReplaceWorkersReady),
        CMD_ADMIN_CHANGE => {
            let payload: ChangePayload = serde_json::from_slice(frame.body()).ok()?;
            Some(ControlEvent::Change {
                group_id: payload.group_id,
                count: payload.count,
            })
        }
        CMD_ADMIN_RELOAD => Some(ControlEvent::Reload),
        CMD_ADMIN_STOP => Some(ControlEvent::Stop),
        _ => None,
    }
}

fn spawn_child(kind: ChildProcessEnv) -> std::io::Result<Child> {
    let exe = std::env::current_exe()?;
    Command::new(exe)
        .args(std::env::args().skip(1))
        .env(CHILD_PROCESS_ENV_KEY, kind.to_env_value())
        .spawn()
}

/// Sends `sig` to a live child via its pid. `libc` is already a
/// transitive dependency through `signal-hook`; `std::process::Child`
/// only exposes a forceful `.kill()` (`SIGKILL`), with no API for a
/// graceful `SIGTERM`.
fn signal_child(child: &Child, sig: i32) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, sig);
    }
}

fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Runs until every child process has exited. Blocking; call from the
/// process that should become the master (i.e. when
/// `ChildProcessEnv::from_env()` is `None`).
pub fn run<F>(config: Config) -> Result<(), String>
where
    F: Frame + ControlFrame,
{
    let signals = MasterSignals::new();
    signals.install();

    let mut m = MasterLoop::<F>::new(config, signals);
    m.boot()?;
    m.monitor_loop();
    Ok(())
}

struct MasterLoop<F: Frame> {
    config: Config,
    signals: MasterSignals,
    proxy: Option<Child>,
    active_workers: Vec<WorkerSlot>,
    shadow_workers: Vec<WorkerSlot>,
    draining_workers: Vec<Child>,
    reload_status: ReloadStatus,
    control: Option<Control>,
    control_reconnect_at: Instant,
    stopping: bool,
    kill_deadline_armed: bool,
    _frame: std::marker::PhantomData<F>,
}

impl<F: Frame + ControlFrame> MasterLoop<F> {
    fn new(config: Config, signals: MasterSignals) -> Self {
        MasterLoop {
            config,
            signals,
            proxy: None,
            active_workers: Vec::new(),
            shadow_workers: Vec::new(),
            draining_workers: Vec::new(),
            reload_status: ReloadStatus::Stopped,
            control: None,
            control_reconnect_at: Instant::now(),
            stopping: false,
            kill_deadline_armed: false,
            _frame: std::marker::PhantomData,
        }
    }

    /// Boot sequence: spawn the proxy, loop-connect to its master
    /// socket, then spawn the initial worker pool (spec.md §4.1).
    fn boot(&mut self) -> Result<(), String> {
        self.proxy = Some(
            spawn_child(ChildProcessEnv::proxy())
                .map_err(|e| format!("failed to spawn proxy: {e}"))?,
        );

        let master_addr = self.config.master_address();
        loop {
            if self.signals.forced_stop_requested() {
                return Err("forced stop requested during boot".to_string());
            }
            match Control::connect::<F>(&master_addr) {
                Ok(control) => {
                    self.control = Some(control);
                    break;
                }
                Err(_) => {
                    thread::sleep(Duration::from_millis(PROXY_CONNECT_BACKOFF_MS));
                }
            }
        }

        for (group_id, group) in self.config.groups.clone() {
            for _ in 0..group.count {
                match spawn_child(ChildProcessEnv::worker(group_id)) {
                    Ok(child) => self.active_workers.push(WorkerSlot { group_id, child }),
                    Err(e) => log::error!("failed to spawn worker for group {group_id}: {e}"),
                }
            }
        }

        log::info!("master booted: proxy running, {} workers started", self.active_workers.len());
        Ok(())
    }

    fn send_control(&mut self, cmd: i32, body: Vec<u8>) {
        match self.control.as_mut() {
            Some(c) => c.send::<F>(cmd, body),
            None => log::error!("no proxy control connection; dropping outbound cmd {cmd}"),
        }
    }

    fn monitor_loop(&mut self) {
        loop {
            self.drain_control_events();
            self.reap_draining_workers();
            self.handle_signals();

            if !self.stopping {
                self.respawn_dead_children();
            }

            if self.reload_status == ReloadStatus::WorkersDone {
                self.complete_reload();
            }

            self.reconnect_control_if_needed();

            if self.stopping && self.all_children_gone() {
                log::info!("master: all children exited, stopping");
                break;
            }

            thread::sleep(Duration::from_millis(MONITOR_TICK_MS));
        }
    }

    fn all_children_gone(&self) -> bool {
        self.proxy.is_none()
            && self.active_workers.is_empty()
            && self.shadow_workers.is_empty()
            && self.draining_workers.is_empty()
    }

    fn drain_control_events(&mut self) {
        let events: Vec<ControlEvent> = match self.control.as_ref() {
            Some(c) => c.events.try_iter().collect(),
            None => return,
        };

        for event in events {
            match event {
                ControlEvent::ReplaceWorkersReady => {
                    self.reload_status = ReloadStatus::WorkersDone;
                }
                ControlEvent::Change { group_id, count } => {
                    self.config.change_group(group_id, count);
                    self.begin_reload();
                }
                ControlEvent::Reload => self.begin_reload(),
                ControlEvent::Stop => self.begin_graceful_stop(),
                ControlEvent::Disconnected => {
                    log::warn!("proxy control connection lost; will reconnect");
                    self.control = None;
                    self.control_reconnect_at =
                        Instant::now() + Duration::from_millis(MASTER_CONTROL_RECONNECT_BACKOFF_MS);
                }
            }
        }
    }

    fn reconnect_control_if_needed(&mut self) {
        if self.control.is_some() || self.stopping || Instant::now() < self.control_reconnect_at {
            return;
        }

        match Control::connect::<F>(&self.config.master_address()) {
            Ok(control) => {
                self.control = Some(control);
                log::info!("reconnected to proxy control channel");
            }
            Err(_) => {
                self.control_reconnect_at =
                    Instant::now() + Duration::from_millis(MASTER_CONTROL_RECONNECT_BACKOFF_MS);
            }
        }
    }

    /// spec.md §4.1 "Reload (hot)": rejected if already reloading.
    fn begin_reload(&mut self) {
        if self.reload_status != ReloadStatus::Stopped {
            log::warn!("reload requested while reload in progress; ignoring");
            return;
        }

        self.reload_status = ReloadStatus::Preparing;
        self.send_control(CMD_ADMIN_RELOAD, Vec::new());

        for (group_id, group) in self.config.groups.clone() {
            for _ in 0..group.count {
                match spawn_child(ChildProcessEnv::worker(group_id)) {
                    Ok(child) => self.shadow_workers.push(WorkerSlot { group_id, child }),
                    Err(e) => log::error!("failed to spawn shadow worker for group {group_id}: {e}"),
                }
            }
        }
    }

    /// spec.md §4.1 monitor loop: "If reload_status == workers_done,
    /// TERM all current active workers, swap the shadow pool into
    /// active, clear shadow, set reload_status = stopped."
    fn complete_reload(&mut self) {
        for slot in self.active_workers.drain(..) {
            signal_child(&slot.child, crate::signals::SIG_GRACEFUL);
            self.draining_workers.push(slot.child);
        }
        self.active_workers = std::mem::take(&mut self.shadow_workers);
        self.reload_status = ReloadStatus::Stopped;
        log::info!("reload complete: {} active workers", self.active_workers.len());
    }

    fn begin_graceful_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        log::info!("master: beginning graceful stop");

        if let Some(p) = self.proxy.as_ref() {
            signal_child(p, crate::signals::SIG_GRACEFUL);
        }
        for slot in self.active_workers.iter().chain(self.shadow_workers.iter()) {
            signal_child(&slot.child, crate::signals::SIG_GRACEFUL);
        }

        self.arm_kill_deadline();
    }

    fn begin_forced_stop(&mut self) {
        log::info!("master: forced stop");
        self.stopping = true;

        if let Some(mut p) = self.proxy.take() {
            let _ = p.kill();
            let _ = p.wait();
        }
        for mut slot in self.active_workers.drain(..).chain(self.shadow_workers.drain(..)) {
            let _ = slot.child.kill();
            let _ = slot.child.wait();
        }
        for mut child in self.draining_workers.drain(..) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// spec.md §4.1 "Forced kill timer": any graceful stop that
    /// specifies a `stop_timeout` starts a detached sleeper that
    /// SIGKILLs whatever pids are still alive at the deadline.
    fn arm_kill_deadline(&mut self) {
        if self.kill_deadline_armed {
            return;
        }
        self.kill_deadline_armed = true;

        let Some(timeout_ms) = self.config.stop_timeout_ms else {
            return;
        };

        let mut pids: Vec<u32> = self
            .active_workers
            .iter()
            .chain(self.shadow_workers.iter())
            .map(|s| s.child.id())
            .collect();
        if let Some(p) = self.proxy.as_ref() {
            pids.push(p.id());
        }

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(timeout_ms));
            for pid in pids {
                if pid_alive(pid) {
                    log::warn!("stop timeout exceeded; SIGKILL pid {pid}");
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                    }
                }
            }
        });
    }

    fn handle_signals(&mut self) {
        if self.signals.forced_stop_requested() {
            self.begin_forced_stop();
            return;
        }
        if self.signals.graceful_stop_requested() {
            self.begin_graceful_stop();
        }
        if self.signals.reload_requested() {
            self.begin_reload();
            self.signals.clear_reload();
        }
    }

    fn respawn_dead_children(&mut self) {
        let proxy_gone = match self.proxy.as_mut() {
            Some(p) => match p.try_wait() {
                Ok(Some(status)) => {
                    log::error!("proxy exited with {status}; respawning");
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    log::error!("error polling proxy process: {e}");
                    false
                }
            },
            None => true,
        };

        if proxy_gone {
            self.proxy = spawn_child(ChildProcessEnv::proxy())
                .map_err(|e| log::error!("failed to respawn proxy: {e}"))
                .ok();
            // The old control connection, if any, is now talking to a
            // dead peer; drop it so we reconnect to the new proxy.
            self.control = None;
            self.control_reconnect_at = Instant::now();
        }

        if self.reload_status == ReloadStatus::Stopped {
            let mut respawned = Vec::new();
            self.active_workers.retain_mut(|slot| {
                match slot.child.try_wait() {
                    Ok(Some(status)) => {
                        log::warn!(
                            "worker (group {}) exited with {status}; respawning",
                            slot.group_id
                        );
                        match spawn_child(ChildProcessEnv::worker(slot.group_id)) {
                            Ok(child) => respawned.push(WorkerSlot {
                                group_id: slot.group_id,
                                child,
                            }),
                            Err(e) => log::error!(
                                "failed to respawn worker for group {}: {e}",
                                slot.group_id
                            ),
                        }
                        false
                    }
                    Ok(None) => true,
                    Err(e) => {
                        log::error!("error polling worker process: {e}");
                        true
                    }
                }
            });
            self.active_workers.extend(respawned);
        }
    }

    fn reap_draining_workers(&mut self) {
        self.draining_workers
            .retain_mut(|child| !matches!(child.try_wait(), Ok(Some(_))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_control_frame_recognizes_replace_workers() {
        use relayd_protocol::BoxFrame;
        let frame = BoxFrame::request(CMD_MASTER_REPLACE_WORKERS, Vec::new());
        assert!(matches!(
            decode_control_frame(&frame),
            Some(ControlEvent::ReplaceWorkersReady)
        ));
    }

    #[test]
    fn decode_control_frame_parses_change_payload() {
        use relayd_protocol::BoxFrame;
        let payload = ChangePayload {
            group_id: 2,
            count: 5,
        };
        let body = serde_json::to_vec(&payload).unwrap();
        let frame = BoxFrame::request(CMD_ADMIN_CHANGE, body);

        match decode_control_frame(&frame) {
            Some(ControlEvent::Change { group_id, count }) => {
                assert_eq!(group_id, 2);
                assert_eq!(count, 5);
            }
            _ => panic!("expected Change event"),
        }
    }

    #[test]
    fn decode_control_frame_rejects_unknown_cmd() {
        use relayd_protocol::BoxFrame;
        let frame = BoxFrame::request(999, Vec::new());
        assert!(decode_control_frame(&frame).is_none());
    }
}
