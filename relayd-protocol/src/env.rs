//! The `{"type": "proxy"|"worker", "group_id": int?}` record carried in
//! `CHILD_PROCESS_ENV_KEY`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcKind {
    Proxy,
    Worker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildProcessEnv {
    #[serde(rename = "type")]
    pub kind: ProcKind,
    pub group_id: Option<u32>,
}

impl ChildProcessEnv {
    pub fn proxy() -> Self {
        ChildProcessEnv {
            kind: ProcKind::Proxy,
            group_id: None,
        }
    }

    pub fn worker(group_id: u32) -> Self {
        ChildProcessEnv {
            kind: ProcKind::Worker,
            group_id: Some(group_id),
        }
    }

    pub fn to_env_value(&self) -> String {
        serde_json::to_string(self).expect("ChildProcessEnv serializes")
    }

    pub fn from_env() -> Option<Self> {
        let raw = std::env::var(super::constants::CHILD_PROCESS_ENV_KEY).ok()?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                log::error!("malformed {}: {e}", super::constants::CHILD_PROCESS_ENV_KEY);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_env_round_trips() {
        let env = ChildProcessEnv::worker(7);
        let s = env.to_env_value();
        let back: ChildProcessEnv = serde_json::from_str(&s).unwrap();
        assert_eq!(back.kind, ProcKind::Worker);
        assert_eq!(back.group_id, Some(7));
    }

    #[test]
    fn proxy_env_has_no_group_id() {
        let env = ChildProcessEnv::proxy();
        let s = env.to_env_value();
        assert!(!s.contains("group_id") || s.contains("null"));
        let back: ChildProcessEnv = serde_json::from_str(&s).unwrap();
        assert_eq!(back.kind, ProcKind::Proxy);
        assert_eq!(back.group_id, None);
    }
}
