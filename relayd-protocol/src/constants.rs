//! Protocol constants shared by master, proxy and worker.

/// Name of the environment variable a spawned child inspects to learn
/// its role. Absence means the process is the master.
pub const CHILD_PROCESS_ENV_KEY: &str = "RELAYD_CHILD_PROCESS";

/// Internal command: proxy -> worker, "here is a task to run".
pub const CMD_WORKER_TASK_ASSIGN: i32 = -1;

/// Internal command: proxy -> master, "the shadow pool is fully registered".
pub const CMD_MASTER_REPLACE_WORKERS: i32 = -2;

/// Admin commands, carried as the `cmd` of a frame whose body is JSON.
pub const CMD_ADMIN_SERVER_STAT: i32 = -100;
pub const CMD_ADMIN_CHANGE: i32 = -101;
pub const CMD_ADMIN_RELOAD: i32 = -102;
pub const CMD_ADMIN_STOP: i32 = -103;

/// `ret` value returned when admin auth fails. No body accompanies it.
pub const RET_ADMIN_AUTH_FAIL: i32 = -1;

/// `ret` value used when a worker dies mid-task or a handler panics.
pub const RET_WORKER_ERROR: i32 = -2;

/// `ret` value used when an admin request's body can't be parsed.
pub const RET_ADMIN_BAD_REQUEST: i32 = -3;

/// Default TCP accept backlog.
pub const DEFAULT_SERVER_BACKLOG: i32 = 128;

/// Default client idle timeout, in milliseconds. `None` in `Config`
/// means never-expire; this is only the value the original project
/// shipped as a default when the feature is enabled.
pub const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 30_000;

/// How often the master's monitor loop wakes to check on children.
pub const MONITOR_TICK_MS: u64 = 100;

/// Backoff between master's attempts to connect to the proxy at boot.
pub const PROXY_CONNECT_BACKOFF_MS: u64 = 100;

/// Backoff between the master's reconnect attempts to the proxy control
/// channel after a disconnect.
pub const MASTER_CONTROL_RECONNECT_BACKOFF_MS: u64 = 1_000;
