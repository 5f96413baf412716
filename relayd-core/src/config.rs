//! Programmatic configuration. Built by the embedding application; no
//! CLI flag parsing or config-file loading lives here (spec.md §1 keeps
//! both out of scope for the core — see demos for how a caller might
//! wire `clap` on top of this).

use relayd_protocol::constants::{DEFAULT_CLIENT_TIMEOUT_MS, DEFAULT_SERVER_BACKLOG};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// `GROUP_CONFIG` entry: a pool of `count` interchangeable workers
/// serving the commands the application's group router sends to
/// `group_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupConfig {
    pub group_id: u32,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,

    /// Directory holding the Unix-domain sockets used for master/worker/
    /// admin IPC.
    pub ipc_address_directory: PathBuf,

    /// Per-group worker pool sizes. Mutable at runtime via `CMD_ADMIN_CHANGE`.
    pub groups: BTreeMap<u32, GroupConfig>,

    /// `None` means a client connection never expires from inactivity.
    pub client_timeout_ms: Option<u64>,

    /// `None` means a worker never self-terminates on a slow handler.
    pub job_timeout_ms: Option<u64>,

    /// `None` means graceful stop/reload waits forever for children to exit.
    pub stop_timeout_ms: Option<u64>,

    pub admin_username: String,
    pub admin_password: String,
}

impl Config {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Config {
            host: host.into(),
            port,
            backlog: DEFAULT_SERVER_BACKLOG,
            ipc_address_directory: PathBuf::from("/tmp/relayd"),
            groups: BTreeMap::new(),
            client_timeout_ms: Some(DEFAULT_CLIENT_TIMEOUT_MS),
            job_timeout_ms: None,
            stop_timeout_ms: None,
            admin_username: String::new(),
            admin_password: String::new(),
        }
    }

    pub fn with_group(mut self, group_id: u32, count: usize) -> Self {
        self.groups.insert(group_id, GroupConfig { group_id, count });
        self
    }

    pub fn master_address(&self) -> PathBuf {
        self.ipc_address_directory.join("master.sock")
    }

    pub fn admin_address(&self) -> PathBuf {
        self.ipc_address_directory.join("admin.sock")
    }

    pub fn worker_address(&self, group_id: u32) -> PathBuf {
        self.ipc_address_directory
            .join(format!("worker-{group_id}.sock"))
    }

    /// Apply a `CMD_ADMIN_CHANGE`. A `count` of zero removes the group.
    pub fn change_group(&mut self, group_id: u32, count: usize) {
        if count == 0 {
            self.groups.remove(&group_id);
        } else {
            self.groups.insert(group_id, GroupConfig { group_id, count });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_group_zero_removes_it() {
        let mut cfg = Config::new("127.0.0.1", 9000).with_group(1, 3);
        assert_eq!(cfg.groups.get(&1).unwrap().count, 3);

        cfg.change_group(1, 0);
        assert!(cfg.groups.get(&1).is_none());
    }

    #[test]
    fn change_group_updates_existing() {
        let mut cfg = Config::new("127.0.0.1", 9000).with_group(1, 3);
        cfg.change_group(1, 5);
        assert_eq!(cfg.groups.get(&1).unwrap().count, 5);
    }
}
