//! The proxy process (spec.md §2, §3, §4.2, §6).
//!
//! Ties `relayd-protocol`'s framing, [`crate::dispatcher::Dispatcher`]'s
//! pure queueing logic, and `mptc::Server`'s worker-thread pool
//! together: every accepted connection -- client, worker, admin or
//! master -- is one `mptc::Request`, handled for its entire lifetime by
//! one mptc worker thread, which forwards decoded frames to a single
//! dispatcher thread over `mpsc`. That dispatcher thread is the only
//! place touching `Dispatcher`/`ReloadHelper`/`StatCounter`, which is
//! what gives the "no locks" property spec.md §5 asks for.

use crate::config::Config;
use crate::dispatcher::{Assignment, Dispatcher};
use crate::handler::GroupRouter;
use crate::io::{is_timeout, Duplex, FrameReader};
use crate::reload::ReloadHelper;
use crate::stats::StatCounter;
use crate::task::{ConnId, Task, TaskContainer, TaskFrame};
use relayd_protocol::admin::{AdminRequest, ChangePayload, EmptyPayload, ServerStat, WorkerCounts};
use relayd_protocol::constants::*;
use relayd_protocol::{ControlFrame, Frame};
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnKind {
    Client,
    Worker(u32),
    Admin,
    Master,
}

struct AcceptedConn {
    kind: ConnKind,
    stream: Option<Box<dyn Duplex>>,
    peer_ip_num: u32,
}

impl mptc::Request for AcceptedConn {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl AcceptedConn {
    fn downcast(req: &mut Box<dyn mptc::Request>) -> &mut AcceptedConn {
        req.as_any_mut()
            .downcast_mut::<AcceptedConn>()
            .expect("proxy only ever enqueues AcceptedConn")
    }
}

fn spawn_tcp_acceptor(listener: TcpListener, tx: mpsc::Sender<Box<dyn mptc::Request>>) {
    thread::spawn(move || loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                let peer_ip_num = match addr.ip() {
                    std::net::IpAddr::V4(v4) => u32::from(v4),
                    std::net::IpAddr::V6(_) => 0,
                };
                let conn = AcceptedConn {
                    kind: ConnKind::Client,
                    stream: Some(Box::new(stream)),
                    peer_ip_num,
                };
                if tx.send(Box::new(conn)).is_err() {
                    return;
                }
            }
            Err(e) => {
                log::error!("client listener accept error: {e}");
                return;
            }
        }
    });
}

fn spawn_unix_acceptor(
    listener: UnixListener,
    kind: ConnKind,
    tx: mpsc::Sender<Box<dyn mptc::Request>>,
) {
    thread::spawn(move || loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let conn = AcceptedConn {
                    kind,
                    stream: Some(Box::new(stream)),
                    peer_ip_num: 0,
                };
                if tx.send(Box::new(conn)).is_err() {
                    return;
                }
            }
            Err(e) => {
                log::error!("{kind:?} listener accept error: {e}");
                return;
            }
        }
    });
}

/// Messages connection-handler threads send to the single dispatcher
/// thread. The dispatcher thread owns every piece of mutable proxy
/// state; nothing else touches it.
enum DispatchEvent<F: Frame> {
    ClientConnected {
        conn_id: ConnId,
        ip_num: u32,
        writer: Box<dyn Duplex>,
    },
    ClientFrame {
        conn_id: ConnId,
        frame: F,
    },
    ClientGone {
        conn_id: ConnId,
    },
    WorkerConnected {
        worker_id: u64,
        group_id: u32,
        writer: Box<dyn Duplex>,
    },
    WorkerFrame {
        worker_id: u64,
        frame: F,
    },
    WorkerGone {
        worker_id: u64,
    },
    MasterConnected {
        writer: Box<dyn Duplex>,
    },
    MasterGone,
    /// Arrived over the admin socket, already authenticated; applied
    /// locally and (except for stat queries) forwarded to master.
    AdminCommand {
        cmd: AdminCmd,
        reply: Option<mpsc::Sender<ServerStat>>,
    },
    /// Arrived over the master connection (e.g. master's own SIGHUP
    /// handling); applied locally only, never re-forwarded.
    MasterCommand {
        cmd: AdminCmd,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum AdminCmd {
    ServerStat,
    Change(ChangePayload),
    Reload,
    Stop,
}

struct ProxyStream<F: Frame> {
    accept_rx: mpsc::Receiver<Box<dyn mptc::Request>>,
    dispatch_tx: mpsc::Sender<DispatchEvent<F>>,
    conn_id_gen: Arc<AtomicU64>,
    worker_id_gen: Arc<AtomicU64>,
    config: Arc<Config>,
}

impl<F: Frame + TaskFrame + ControlFrame> mptc::RequestStream for ProxyStream<F> {
    fn next(&mut self) -> Result<Option<Box<dyn mptc::Request>>, String> {
        match self
            .accept_rx
            .recv_timeout(Duration::from_secs(mptc::SIGNAL_POLL_INTERVAL))
        {
            Ok(req) => Ok(Some(req)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err("all proxy acceptor threads have exited".to_string())
            }
        }
    }

    fn new_handler(&mut self) -> Box<dyn mptc::RequestHandler> {
        Box::new(ProxyHandler {
            dispatch_tx: self.dispatch_tx.clone(),
            conn_id_gen: self.conn_id_gen.clone(),
            worker_id_gen: self.worker_id_gen.clone(),
            config: self.config.clone(),
        })
    }
}

struct ProxyHandler<F: Frame> {
    dispatch_tx: mpsc::Sender<DispatchEvent<F>>,
    conn_id_gen: Arc<AtomicU64>,
    worker_id_gen: Arc<AtomicU64>,
    config: Arc<Config>,
}

impl<F: Frame + TaskFrame + ControlFrame> mptc::RequestHandler for ProxyHandler<F> {
    fn process(&mut self, mut request: Box<dyn mptc::Request>) -> Result<(), String> {
        let conn = AcceptedConn::downcast(&mut request);
        let kind = conn.kind;
        let stream = conn.stream.take().expect("connection stream present once");
        let peer_ip_num = conn.peer_ip_num;

        match kind {
            ConnKind::Client => {
                let conn_id = self.conn_id_gen.fetch_add(1, Ordering::Relaxed);
                handle_client::<F>(
                    self.dispatch_tx.clone(),
                    conn_id,
                    peer_ip_num,
                    stream,
                    self.config.client_timeout_ms,
                )
            }
            ConnKind::Worker(group_id) => {
                let worker_id = self.worker_id_gen.fetch_add(1, Ordering::Relaxed);
                handle_worker::<F>(self.dispatch_tx.clone(), worker_id, group_id, stream)
            }
            ConnKind::Admin => handle_admin::<F>(self.dispatch_tx.clone(), &self.config, stream),
            ConnKind::Master => handle_master::<F>(self.dispatch_tx.clone(), stream),
        }
    }
}

fn handle_client<F: Frame>(
    dispatch_tx: mpsc::Sender<DispatchEvent<F>>,
    conn_id: ConnId,
    ip_num: u32,
    mut stream: Box<dyn Duplex>,
    client_timeout_ms: Option<u64>,
) -> Result<(), String> {
    // spec.md §4.2 "Client idle timeout": a read timeout on the socket
    // itself resets on every byte received, so it's exactly the idle
    // deadline the spec asks for, not a fixed connection lifetime.
    if let Some(ms) = client_timeout_ms {
        if let Err(e) = stream.set_read_timeout(Some(Duration::from_millis(ms))) {
            log::warn!("client {conn_id}: failed to set idle timeout: {e}");
        }
    }

    let writer = stream.try_clone_box().map_err(|e| e.to_string())?;
    let _ = dispatch_tx.send(DispatchEvent::ClientConnected {
        conn_id,
        ip_num,
        writer,
    });

    let mut reader = FrameReader::new(stream);
    loop {
        match reader.next_frame::<F>() {
            Ok(Some(frame)) => {
                if dispatch_tx
                    .send(DispatchEvent::ClientFrame { conn_id, frame })
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) if is_timeout(&e) => {
                log::debug!("client {conn_id} idle timeout; closing connection");
                break;
            }
            Err(e) => {
                log::debug!("client {conn_id} connection error: {e}");
                break;
            }
        }
    }

    let _ = dispatch_tx.send(DispatchEvent::ClientGone { conn_id });
    Ok(())
}

fn handle_worker<F: Frame>(
    dispatch_tx: mpsc::Sender<DispatchEvent<F>>,
    worker_id: u64,
    group_id: u32,
    mut stream: Box<dyn Duplex>,
) -> Result<(), String> {
    let writer = stream.try_clone_box().map_err(|e| e.to_string())?;
    let _ = dispatch_tx.send(DispatchEvent::WorkerConnected {
        worker_id,
        group_id,
        writer,
    });

    let mut reader = FrameReader::new(stream);
    loop {
        match reader.next_frame::<F>() {
            Ok(Some(frame)) => {
                if dispatch_tx
                    .send(DispatchEvent::WorkerFrame { worker_id, frame })
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::debug!("worker {worker_id} connection error: {e}");
                break;
            }
        }
    }

    let _ = dispatch_tx.send(DispatchEvent::WorkerGone { worker_id });
    Ok(())
}

fn handle_master<F: Frame>(
    dispatch_tx: mpsc::Sender<DispatchEvent<F>>,
    mut stream: Box<dyn Duplex>,
) -> Result<(), String> {
    let writer = stream.try_clone_box().map_err(|e| e.to_string())?;
    let _ = dispatch_tx.send(DispatchEvent::MasterConnected { writer });

    let mut reader = FrameReader::new(stream);
    loop {
        match reader.next_frame::<F>() {
            Ok(Some(frame)) => match admin_cmd_from_frame(&frame, None) {
                Some(cmd) => {
                    if dispatch_tx.send(DispatchEvent::MasterCommand { cmd }).is_err() {
                        break;
                    }
                }
                None => log::warn!("master sent frame with unrecognized cmd {}", frame.cmd()),
            },
            Ok(None) => break,
            Err(e) => {
                log::debug!("master connection error: {e}");
                break;
            }
        }
    }

    let _ = dispatch_tx.send(DispatchEvent::MasterGone);
    Ok(())
}

fn handle_admin<F: Frame>(
    dispatch_tx: mpsc::Sender<DispatchEvent<F>>,
    config: &Config,
    mut stream: Box<dyn Duplex>,
) -> Result<(), String> {
    let mut writer = stream.try_clone_box().map_err(|e| e.to_string())?;
    let mut reader = FrameReader::new(stream);

    let frame: F = match reader.next_frame().map_err(|e| e.to_string())? {
        Some(f) => f,
        None => return Ok(()),
    };

    let response = match admin_cmd_from_frame(&frame, Some(config)) {
        Some(Ok(cmd)) => {
            let reply = if matches!(cmd, AdminCmd::ServerStat) {
                let (tx, rx) = mpsc::channel();
                if dispatch_tx
                    .send(DispatchEvent::AdminCommand {
                        cmd,
                        reply: Some(tx),
                    })
                    .is_err()
                {
                    None
                } else {
                    rx.recv_timeout(Duration::from_secs(5)).ok()
                }
            } else {
                let _ = dispatch_tx.send(DispatchEvent::AdminCommand { cmd, reply: None });
                None
            };

            match reply {
                Some(stat) => {
                    let body = serde_json::to_vec(&stat).map_err(|e| e.to_string())?;
                    frame.with_ret(0).with_body(body)
                }
                None if frame.cmd() == CMD_ADMIN_SERVER_STAT => {
                    frame.with_ret(RET_ADMIN_BAD_REQUEST)
                }
                None => frame.with_ret(0),
            }
        }
        Some(Err(())) => frame.with_ret(RET_ADMIN_AUTH_FAIL),
        None => frame.with_ret(RET_ADMIN_BAD_REQUEST),
    };

    writer
        .write_all(&response.encode())
        .map_err(|e| e.to_string())
}

/// Parses an admin-protocol frame into an `AdminCmd`.
///
/// When `config` is `Some`, the frame is expected to carry an
/// `AdminRequest<P>` (auth + payload), as it does coming from the admin
/// socket, and credentials are checked against it (`Some(Err(()))` on
/// mismatch). When `config` is `None` (the master connection, already
/// trusted), the body is the bare payload with no auth wrapper.
fn admin_cmd_from_frame<F: Frame>(
    frame: &F,
    config: Option<&Config>,
) -> Option<Result<AdminCmd, ()>> {
    fn check(config: Option<&Config>, auth: &relayd_protocol::admin::AdminAuth) -> bool {
        match config {
            None => true,
            Some(cfg) => auth.username == cfg.admin_username && auth.password == cfg.admin_password,
        }
    }

    match frame.cmd() {
        CMD_ADMIN_SERVER_STAT => match config {
            Some(_) => {
                let req: AdminRequest<EmptyPayload> = serde_json::from_slice(frame.body()).ok()?;
                Some(if check(config, &req.auth) {
                    Ok(AdminCmd::ServerStat)
                } else {
                    Err(())
                })
            }
            None => Some(Ok(AdminCmd::ServerStat)),
        },
        CMD_ADMIN_CHANGE => match config {
            Some(_) => {
                let req: AdminRequest<ChangePayload> = serde_json::from_slice(frame.body()).ok()?;
                Some(if check(config, &req.auth) {
                    Ok(AdminCmd::Change(req.payload))
                } else {
                    Err(())
                })
            }
            None => {
                let payload: ChangePayload = serde_json::from_slice(frame.body()).ok()?;
                Some(Ok(AdminCmd::Change(payload)))
            }
        },
        CMD_ADMIN_RELOAD => match config {
            Some(_) => {
                let req: AdminRequest<EmptyPayload> = serde_json::from_slice(frame.body()).ok()?;
                Some(if check(config, &req.auth) {
                    Ok(AdminCmd::Reload)
                } else {
                    Err(())
                })
            }
            None => Some(Ok(AdminCmd::Reload)),
        },
        CMD_ADMIN_STOP => match config {
            Some(_) => {
                let req: AdminRequest<EmptyPayload> = serde_json::from_slice(frame.body()).ok()?;
                Some(if check(config, &req.auth) {
                    Ok(AdminCmd::Stop)
                } else {
                    Err(())
                })
            }
            None => Some(Ok(AdminCmd::Stop)),
        },
        _ => None,
    }
}

/// All mutable proxy state, touched only from the dispatcher thread.
struct ProxyState<F: Frame> {
    dispatcher: Dispatcher<F>,
    reload: ReloadHelper,
    stats: StatCounter,
    group_router: GroupRouter<F>,
    client_writers: HashMap<ConnId, Box<dyn Duplex>>,
    client_ip: HashMap<ConnId, u32>,
    worker_writers: HashMap<u64, Box<dyn Duplex>>,
    worker_group: HashMap<u64, u32>,
    /// Workers that have connected and handshaken with `reload` while a
    /// reload is running, but are not yet in `dispatcher`'s idle pool
    /// (spec.md §4.2: "keep dispatching to the active workers only...
    /// shadow workers... are not added to the idle pool until swap").
    shadow_workers: HashSet<u64>,
    master_writer: Option<Box<dyn Duplex>>,
    group_counts: BTreeMap<u32, usize>,
}

impl<F: Frame + TaskFrame + ControlFrame> ProxyState<F> {
    fn assign_to_worker(&mut self, worker_id: u64, task: TaskContainer<F>) {
        let frame = task.task.to_assign_frame();
        if let Some(w) = self.worker_writers.get_mut(&worker_id) {
            self.stats.record_worker_request();
            if let Err(e) = w.write_all(&frame.encode()) {
                log::error!("error writing task to worker {worker_id}: {e}");
                return;
            }
            self.dispatcher.mark_in_flight(worker_id, task);
        }
    }

    fn apply_assignment(&mut self, assignment: Assignment<F>) {
        if let Assignment::ToWorker { worker_id, task } = assignment {
            self.assign_to_worker(worker_id, task);
        }
    }

    fn deliver_response(&mut self, conn_id: ConnId, frame: &F) {
        self.stats.record_client_response();
        if let Some(w) = self.client_writers.get_mut(&conn_id) {
            if let Err(e) = w.write_all(&frame.encode()) {
                log::debug!("error writing response to client {conn_id}: {e}");
            }
        }
        // Client already disconnected: per design, the response is
        // still counted (the job completed) even though it's dropped.
    }

    fn notify_master_ready(&mut self) {
        if let Some(w) = self.master_writer.as_mut() {
            let frame = F::control(CMD_MASTER_REPLACE_WORKERS, Vec::new());
            if let Err(e) = w.write_all(&frame.encode()) {
                log::error!("error notifying master of completed reload: {e}");
            }
        } else {
            log::error!("reload completed but no master connection to notify");
        }
    }

    fn forward_to_master(&mut self, cmd: i32, body: Vec<u8>) {
        if let Some(w) = self.master_writer.as_mut() {
            let frame = F::control(cmd, body);
            if let Err(e) = w.write_all(&frame.encode()) {
                log::error!("error forwarding admin command to master: {e}");
            }
        } else {
            log::error!("admin command received but no master connection to forward to");
        }
    }

    fn server_stat(&self) -> ServerStat {
        let all_groups: std::collections::HashSet<u32> = self
            .group_counts
            .keys()
            .copied()
            .chain(self.dispatcher.all_group_ids())
            .collect();

        let pending_jobs = all_groups
            .iter()
            .map(|g| (*g, self.dispatcher.pending_jobs(*g)))
            .collect();

        let job_times = self
            .stats
            .jobs_time_counter
            .iter()
            .map(|(g, hist)| (*g, hist.as_map()))
            .collect();

        ServerStat {
            clients: self.stats.clients,
            client_req: self.stats.client_req,
            client_rsp: self.stats.client_rsp,
            worker_req: self.stats.worker_req,
            worker_rsp: self.stats.worker_rsp,
            workers: WorkerCounts {
                all: self.dispatcher.total_idle() + self.dispatcher.total_busy(),
                idle: self.dispatcher.total_idle(),
                busy: self.dispatcher.total_busy(),
            },
            pending_jobs,
            job_times,
        }
    }

    /// Shared handling for commands that arrived via the admin socket
    /// (forwarded on) or the master connection (applied only).
    fn apply_admin_cmd(&mut self, cmd: AdminCmd, forward: bool) {
        match cmd {
            AdminCmd::ServerStat => {} // handled by caller via `reply`
            AdminCmd::Change(payload) => {
                if payload.count == 0 {
                    self.group_counts.remove(&payload.group_id);
                } else {
                    self.group_counts.insert(payload.group_id, payload.count);
                }
                if forward {
                    if let Ok(body) = serde_json::to_vec(&payload) {
                        self.forward_to_master(CMD_ADMIN_CHANGE, body);
                    }
                }
            }
            AdminCmd::Reload => {
                self.reload.start();
                if forward {
                    self.forward_to_master(CMD_ADMIN_RELOAD, Vec::new());
                }
            }
            AdminCmd::Stop => {
                if forward {
                    self.forward_to_master(CMD_ADMIN_STOP, Vec::new());
                }
            }
        }
    }
}

/// Runs on its own thread for the lifetime of the proxy process. Every
/// piece of shared mutable state lives here; everything else is `mpsc`.
fn run_dispatcher<F: Frame + TaskFrame + ControlFrame>(
    rx: mpsc::Receiver<DispatchEvent<F>>,
    group_router: GroupRouter<F>,
    group_counts: BTreeMap<u32, usize>,
) {
    let mut state: ProxyState<F> = ProxyState {
        dispatcher: Dispatcher::new(),
        reload: ReloadHelper::new(),
        stats: StatCounter::default(),
        group_router,
        client_writers: HashMap::new(),
        client_ip: HashMap::new(),
        worker_writers: HashMap::new(),
        worker_group: HashMap::new(),
        shadow_workers: HashSet::new(),
        master_writer: None,
        group_counts,
    };

    while let Ok(event) = rx.recv() {
        match event {
            DispatchEvent::ClientConnected {
                conn_id,
                ip_num,
                writer,
            } => {
                state.client_writers.insert(conn_id, writer);
                state.client_ip.insert(conn_id, ip_num);
                state.stats.client_connected();
            }
            DispatchEvent::ClientFrame { conn_id, frame } => {
                state.stats.record_client_request();
                let ip_num = state.client_ip.get(&conn_id).copied().unwrap_or(0);
                let group_id = (state.group_router)(&frame);
                let task = Task::new(ip_num, frame.encode());
                let tc = TaskContainer::new(task, conn_id);
                let assignment = state.dispatcher.add_task(group_id, tc);
                state.apply_assignment(assignment);
            }
            DispatchEvent::ClientGone { conn_id } => {
                state.client_writers.remove(&conn_id);
                state.client_ip.remove(&conn_id);
                state.dispatcher.drop_client_tasks(conn_id);
                state.stats.client_disconnected();
            }
            DispatchEvent::WorkerConnected {
                worker_id,
                group_id,
                writer,
            } => {
                state.worker_writers.insert(worker_id, writer);
                state.worker_group.insert(worker_id, group_id);

                if state.reload.running() {
                    // Shadow worker: handshake with `reload` only. It
                    // stays out of the dispatcher's idle pool until the
                    // whole shadow generation has registered, so it can
                    // never be handed a task ahead of the swap.
                    state.shadow_workers.insert(worker_id);
                    if state
                        .reload
                        .add_worker(worker_id, group_id, &state.group_counts)
                    {
                        let promoted: Vec<u64> = state.shadow_workers.drain().collect();
                        for id in promoted {
                            if let Some(gid) = state.worker_group.get(&id).copied() {
                                let assignment = state.dispatcher.register_worker(id, gid);
                                state.apply_assignment(assignment);
                            }
                        }
                        state.notify_master_ready();
                        state.reload.stop();
                    }
                } else {
                    let assignment = state.dispatcher.register_worker(worker_id, group_id);
                    state.apply_assignment(assignment);
                }
            }
            DispatchEvent::WorkerFrame { worker_id, frame } => {
                if let Some(in_flight) = state.dispatcher.take_response(worker_id) {
                    let group_id = state.worker_group.get(&worker_id).copied().unwrap_or(0);
                    state
                        .stats
                        .record_worker_response(group_id, in_flight.started_at.elapsed());
                    state.deliver_response(in_flight.container.client_conn_id, &frame);
                }
                let assignment = state.dispatcher.worker_idle(worker_id);
                state.apply_assignment(assignment);
            }
            DispatchEvent::WorkerGone { worker_id } => {
                let group_id = state.worker_group.remove(&worker_id);
                state.worker_writers.remove(&worker_id);
                state.shadow_workers.remove(&worker_id);
                if let Some(lost) = state.dispatcher.worker_gone(worker_id) {
                    log::error!(
                        "worker {worker_id} (group {group_id:?}) disconnected with a task in flight"
                    );
                    if let relayd_protocol::Parsed::Complete(client_frame, _) =
                        F::parse(&lost.task.body)
                    {
                        let err_frame =
                            client_frame.with_ret(RET_WORKER_ERROR).with_body(Vec::new());
                        state.deliver_response(lost.client_conn_id, &err_frame);
                    }
                }
            }
            DispatchEvent::MasterConnected { writer } => {
                state.master_writer = Some(writer);
            }
            DispatchEvent::MasterGone => {
                state.master_writer = None;
            }
            DispatchEvent::AdminCommand { cmd, reply } => {
                if let (AdminCmd::ServerStat, Some(reply)) = (&cmd, &reply) {
                    let _ = reply.send(state.server_stat());
                } else {
                    state.apply_admin_cmd(cmd, true);
                }
            }
            DispatchEvent::MasterCommand { cmd } => {
                state.apply_admin_cmd(cmd, false);
            }
        }
    }

    log::info!("dispatcher thread exiting: all senders dropped");
}

fn cvt(ret: libc::c_int) -> std::io::Result<libc::c_int> {
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Binds the client-facing TCP listener with `config.backlog` as its
/// accept queue size. `std::net::TcpListener::bind` always listens with
/// a fixed platform default and exposes no way to override it, so the
/// socket is built by hand with the same socket()/setsockopt()/bind()/
/// listen() sequence `std` uses internally, just with our own backlog
/// passed to `listen()`.
fn bind_tcp_with_backlog(host: &str, port: u16, backlog: i32) -> std::io::Result<TcpListener> {
    let addr: SocketAddr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no address resolved for client listener",
            )
        })?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = cvt(unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) })?;

    let close_on_err = |e: std::io::Error| -> std::io::Error {
        unsafe { libc::close(fd) };
        e
    };

    let reuseaddr: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuseaddr as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })
    .map_err(close_on_err)?;

    match addr {
        SocketAddr::V4(ref a) => cvt(unsafe {
            libc::bind(
                fd,
                a as *const _ as *const libc::sockaddr,
                std::mem::size_of_val(a) as libc::socklen_t,
            )
        }),
        SocketAddr::V6(ref a) => cvt(unsafe {
            libc::bind(
                fd,
                a as *const _ as *const libc::sockaddr,
                std::mem::size_of_val(a) as libc::socklen_t,
            )
        }),
    }
    .map_err(close_on_err)?;

    cvt(unsafe { libc::listen(fd, backlog) }).map_err(close_on_err)?;

    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

/// Binds every listener this proxy process needs and runs until the
/// `mptc::Server` loop exits (on an unrecoverable stream error; normal
/// shutdown/reload are driven by admin/master commands rather than
/// local signal handling, since the master process owns process
/// lifecycle for the whole system).
pub fn run<F>(config: Config, group_router: GroupRouter<F>) -> Result<(), String>
where
    F: Frame + TaskFrame + ControlFrame,
{
    std::fs::create_dir_all(&config.ipc_address_directory)
        .map_err(|e| format!("cannot create ipc directory: {e}"))?;

    let client_listener = bind_tcp_with_backlog(&config.host, config.port, config.backlog)
        .map_err(|e| format!("cannot bind client listener: {e}"))?;

    let admin_path = config.admin_address();
    let _ = std::fs::remove_file(&admin_path);
    let admin_listener =
        UnixListener::bind(&admin_path).map_err(|e| format!("cannot bind admin socket: {e}"))?;

    let master_path = config.master_address();
    let _ = std::fs::remove_file(&master_path);
    let master_listener =
        UnixListener::bind(&master_path).map_err(|e| format!("cannot bind master socket: {e}"))?;

    let mut worker_listeners = Vec::new();
    for group_id in config.groups.keys().copied() {
        let path = config.worker_address(group_id);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)
            .map_err(|e| format!("cannot bind worker socket for group {group_id}: {e}"))?;
        worker_listeners.push((group_id, listener));
    }

    let (accept_tx, accept_rx) = mpsc::channel::<Box<dyn mptc::Request>>();
    spawn_tcp_acceptor(client_listener, accept_tx.clone());
    spawn_unix_acceptor(admin_listener, ConnKind::Admin, accept_tx.clone());
    spawn_unix_acceptor(master_listener, ConnKind::Master, accept_tx.clone());
    for (group_id, listener) in worker_listeners {
        spawn_unix_acceptor(listener, ConnKind::Worker(group_id), accept_tx.clone());
    }

    let (dispatch_tx, dispatch_rx) = mpsc::channel::<DispatchEvent<F>>();
    let group_counts: BTreeMap<u32, usize> =
        config.groups.iter().map(|(g, c)| (*g, c.count)).collect();

    thread::spawn(move || run_dispatcher(dispatch_rx, group_router, group_counts));

    let stream = ProxyStream::<F> {
        accept_rx,
        dispatch_tx,
        conn_id_gen: Arc::new(AtomicU64::new(1)),
        worker_id_gen: Arc::new(AtomicU64::new(1)),
        config: Arc::new(config),
    };

    let mut server = mptc::Server::new(Box::new(stream));
    server.run();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_kind_is_copy_and_comparable() {
        assert_eq!(ConnKind::Worker(3), ConnKind::Worker(3));
        assert_ne!(ConnKind::Worker(3), ConnKind::Worker(4));
    }

    #[test]
    fn admin_cmd_from_frame_rejects_bad_credentials() {
        use relayd_protocol::admin::AdminAuth;
        use relayd_protocol::BoxFrame;

        let cfg = Config::new("127.0.0.1", 0);
        let req = AdminRequest {
            auth: AdminAuth {
                username: "wrong".into(),
                password: "wrong".into(),
            },
            payload: EmptyPayload::default(),
        };
        let body = serde_json::to_vec(&req).unwrap();
        let frame = BoxFrame::request(CMD_ADMIN_RELOAD, body);

        assert_eq!(admin_cmd_from_frame(&frame, Some(&cfg)), Some(Err(())));
    }

    #[test]
    fn admin_cmd_from_frame_trusts_master_channel_without_auth() {
        use relayd_protocol::BoxFrame;

        let payload = ChangePayload {
            group_id: 1,
            count: 3,
        };
        let body = serde_json::to_vec(&payload).unwrap();
        let frame = BoxFrame::request(CMD_ADMIN_CHANGE, body);

        match admin_cmd_from_frame(&frame, None) {
            Some(Ok(AdminCmd::Change(p))) => assert_eq!(p.group_id, 1),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
