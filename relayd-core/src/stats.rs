//! Proxy-lifetime counters reported by `CMD_ADMIN_SERVER_STAT` (spec.md §3, §4.2).

use std::collections::HashMap;
use std::time::Duration;

/// Fixed millisecond buckets for per-group job-time reporting. The
/// original project's `jobs_time_counter` is a simple `Counter` keyed by
/// a bucketed elapsed time; this keeps that shape rather than pulling in
/// a full histogram crate for one admin stat.
const BUCKET_BOUNDS_MS: &[(u64, &str)] = &[
    (10, "0-10ms"),
    (50, "10-50ms"),
    (100, "50-100ms"),
    (500, "100-500ms"),
    (1_000, "500ms-1s"),
    (u64::MAX, "1s+"),
];

#[derive(Debug, Clone, Default)]
pub struct JobTimeHistogram {
    buckets: HashMap<&'static str, u64>,
}

impl JobTimeHistogram {
    pub fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let label = BUCKET_BOUNDS_MS
            .iter()
            .find(|(bound, _)| ms <= *bound)
            .map(|(_, label)| *label)
            .unwrap_or("1s+");
        *self.buckets.entry(label).or_insert(0) += 1;
    }

    pub fn as_map(&self) -> HashMap<String, u64> {
        self.buckets
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatCounter {
    pub clients: usize,
    pub client_req: u64,
    pub client_rsp: u64,
    pub worker_req: u64,
    pub worker_rsp: u64,
    pub jobs_time_counter: HashMap<u32, JobTimeHistogram>,
}

impl StatCounter {
    pub fn client_connected(&mut self) {
        self.clients += 1;
    }

    pub fn client_disconnected(&mut self) {
        self.clients = self.clients.saturating_sub(1);
    }

    pub fn record_client_request(&mut self) {
        self.client_req += 1;
    }

    pub fn record_client_response(&mut self) {
        self.client_rsp += 1;
    }

    pub fn record_worker_request(&mut self) {
        self.worker_req += 1;
    }

    pub fn record_worker_response(&mut self, group_id: u32, elapsed: Duration) {
        self.worker_rsp += 1;
        self.jobs_time_counter
            .entry(group_id)
            .or_default()
            .record(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_rsp_counters_are_monotonic_and_independent() {
        let mut s = StatCounter::default();
        s.record_client_request();
        s.record_client_request();
        s.record_client_response();

        assert_eq!(s.client_req, 2);
        assert_eq!(s.client_rsp, 1);
        assert!(s.client_req >= s.client_rsp);
    }

    #[test]
    fn job_time_histogram_buckets_fast_and_slow_jobs_separately() {
        let mut h = JobTimeHistogram::default();
        h.record(Duration::from_millis(5));
        h.record(Duration::from_secs(2));

        let map = h.as_map();
        assert_eq!(map.get("0-10ms").copied().unwrap_or(0), 1);
        assert_eq!(map.get("1s+").copied().unwrap_or(0), 1);
    }

    #[test]
    fn client_disconnect_never_underflows() {
        let mut s = StatCounter::default();
        s.client_disconnected();
        assert_eq!(s.clients, 0);
    }
}
