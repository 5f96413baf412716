//! JSON bodies carried by admin-protocol frames (spec.md §4.2, §6).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminAuth {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminRequest<P> {
    pub auth: AdminAuth,
    pub payload: P,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePayload {
    pub group_id: u32,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub all: usize,
    pub idle: usize,
    pub busy: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStat {
    pub clients: usize,
    pub client_req: u64,
    pub client_rsp: u64,
    pub worker_req: u64,
    pub worker_rsp: u64,
    pub workers: WorkerCounts,
    pub pending_jobs: HashMap<u32, usize>,
    pub job_times: HashMap<u32, HashMap<String, u64>>,
}
