//! Per-group FIFO queues + idle worker pool (spec.md §3, §4.2, §9).
//!
//! This module is pure bookkeeping: no sockets, no threads. It is meant
//! to be driven exclusively from a single dispatcher thread (see
//! `proxy.rs`), which is what gives the "no locks needed" property
//! spec.md §5 calls for.

use crate::task::{ConnId, TaskContainer};
use relayd_protocol::Frame;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy,
}

struct WorkerMeta {
    group_id: u32,
    status: WorkerStatus,
}

/// An in-flight assignment: which client to answer, and when the
/// assignment happened (for the job-time histogram).
pub struct InFlight<F: Frame> {
    pub container: TaskContainer<F>,
    pub started_at: Instant,
}

/// Pairs tasks with idle workers, FIFO per group (spec.md glossary:
/// "Dispatcher").
#[derive(Default)]
pub struct Dispatcher<F: Frame> {
    workers: HashMap<u64, WorkerMeta>,
    idle_pool: HashMap<u32, VecDeque<u64>>,
    queues: HashMap<u32, VecDeque<TaskContainer<F>>>,
    in_flight: HashMap<u64, InFlight<F>>,
}

/// What the caller must do as a result of a dispatcher call: write a
/// frame to a specific worker, or nothing (the task was queued / the
/// worker went idle with nothing to do).
pub enum Assignment<F: Frame> {
    ToWorker { worker_id: u64, task: TaskContainer<F> },
    Queued,
    Idle,
}

impl<F: Frame> Dispatcher<F> {
    pub fn new() -> Self {
        Dispatcher {
            workers: HashMap::new(),
            idle_pool: HashMap::new(),
            queues: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    /// A worker process has connected and is ready for work. Registering
    /// is equivalent to an idle arrival: if work is already queued for
    /// its group, it is handed the head of that queue immediately.
    pub fn register_worker(&mut self, worker_id: u64, group_id: u32) -> Assignment<F> {
        self.workers.insert(
            worker_id,
            WorkerMeta {
                group_id,
                status: WorkerStatus::Idle,
            },
        );
        self.worker_idle(worker_id)
    }

    /// spec.md §4.2 `add_task`: assign to an idle worker if one exists
    /// for this group (FIFO over idle arrivals), else enqueue.
    pub fn add_task(&mut self, group_id: u32, tc: TaskContainer<F>) -> Assignment<F> {
        if let Some(worker_id) = self
            .idle_pool
            .get_mut(&group_id)
            .and_then(VecDeque::pop_front)
        {
            self.assign(worker_id, tc)
        } else {
            self.queues.entry(group_id).or_default().push_back(tc);
            Assignment::Queued
        }
    }

    /// spec.md §4.2 `worker_idle`: a worker has finished its task (or
    /// just registered). If its group's queue is non-empty, hand it the
    /// head immediately; otherwise mark it idle.
    pub fn worker_idle(&mut self, worker_id: u64) -> Assignment<F> {
        let group_id = match self.workers.get(&worker_id) {
            Some(w) => w.group_id,
            None => return Assignment::Idle,
        };

        if let Some(tc) = self.queues.get_mut(&group_id).and_then(VecDeque::pop_front) {
            self.assign(worker_id, tc)
        } else {
            if let Some(w) = self.workers.get_mut(&worker_id) {
                w.status = WorkerStatus::Idle;
            }
            self.idle_pool.entry(group_id).or_default().push_back(worker_id);
            Assignment::Idle
        }
    }

    fn assign(&mut self, worker_id: u64, tc: TaskContainer<F>) -> Assignment<F> {
        if let Some(w) = self.workers.get_mut(&worker_id) {
            w.status = WorkerStatus::Busy;
        }
        // Note: caller is responsible for actually writing the assign
        // frame to the worker and for calling `mark_in_flight` once
        // that succeeds, so `in_flight` reflects frames that were
        // actually sent.
        Assignment::ToWorker {
            worker_id,
            task: tc,
        }
    }

    /// Record that `worker_id` is now working on `container` (called
    /// after the assign frame has actually been written).
    pub fn mark_in_flight(&mut self, worker_id: u64, container: TaskContainer<F>) {
        self.in_flight.insert(
            worker_id,
            InFlight {
                container,
                started_at: Instant::now(),
            },
        );
    }

    /// A response arrived from a busy worker: pull its in-flight task
    /// back out so the caller can deliver the response, and the job's
    /// elapsed time for stats.
    pub fn take_response(&mut self, worker_id: u64) -> Option<InFlight<F>> {
        self.in_flight.remove(&worker_id)
    }

    /// spec.md §4.2 `worker_gone`: remove from idle/busy; if it held a
    /// task, return it so the caller can report failure to the client.
    pub fn worker_gone(&mut self, worker_id: u64) -> Option<TaskContainer<F>> {
        if let Some(meta) = self.workers.remove(&worker_id) {
            if let Some(pool) = self.idle_pool.get_mut(&meta.group_id) {
                pool.retain(|id| *id != worker_id);
            }
        }
        self.in_flight.remove(&worker_id).map(|f| f.container)
    }

    /// Drop all tasks queued on behalf of a client that has disconnected
    /// (spec.md §7: "Drop pending enqueued tasks for that client").
    pub fn drop_client_tasks(&mut self, conn_id: ConnId) {
        for queue in self.queues.values_mut() {
            queue.retain(|tc| tc.client_conn_id != conn_id);
        }
    }

    pub fn idle_count(&self, group_id: u32) -> usize {
        self.idle_pool.get(&group_id).map(VecDeque::len).unwrap_or(0)
    }

    pub fn busy_count(&self, group_id: u32) -> usize {
        self.workers
            .values()
            .filter(|w| w.group_id == group_id && w.status == WorkerStatus::Busy)
            .count()
    }

    pub fn pending_jobs(&self, group_id: u32) -> usize {
        self.queues.get(&group_id).map(VecDeque::len).unwrap_or(0)
    }

    pub fn all_group_ids(&self) -> HashSet<u32> {
        self.workers.values().map(|w| w.group_id).collect()
    }

    pub fn total_idle(&self) -> usize {
        self.idle_pool.values().map(VecDeque::len).sum()
    }

    pub fn total_busy(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.status == WorkerStatus::Busy)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayd_protocol::BoxFrame;
    use crate::task::Task;

    fn tc(conn: ConnId, body: &str) -> TaskContainer<BoxFrame> {
        TaskContainer::new(Task::new(0, body.as_bytes().to_vec()), conn)
    }

    #[test]
    fn add_task_assigns_to_idle_worker_immediately() {
        let mut d: Dispatcher<BoxFrame> = Dispatcher::new();
        d.register_worker(1, 7);

        match d.add_task(7, tc(1, "a")) {
            Assignment::ToWorker { worker_id, .. } => assert_eq!(worker_id, 1),
            _ => panic!("expected immediate assignment"),
        }
        assert_eq!(d.idle_count(7), 0);
    }

    #[test]
    fn add_task_queues_when_no_idle_worker() {
        let mut d: Dispatcher<BoxFrame> = Dispatcher::new();
        match d.add_task(7, tc(1, "a")) {
            Assignment::Queued => {}
            _ => panic!("expected queued"),
        }
        assert_eq!(d.pending_jobs(7), 1);
    }

    #[test]
    fn fifo_within_group_for_queued_tasks() {
        let mut d: Dispatcher<BoxFrame> = Dispatcher::new();
        // No workers yet: both tasks queue.
        d.add_task(7, tc(1, "first"));
        d.add_task(7, tc(2, "second"));

        d.register_worker(1, 7);
        match d.worker_idle(1) {
            Assignment::ToWorker { task, .. } => {
                assert_eq!(task.task.body, b"first");
            }
            _ => panic!(),
        }
    }

    #[test]
    fn worker_idle_arrival_serves_queue_head_immediately() {
        let mut d: Dispatcher<BoxFrame> = Dispatcher::new();
        d.register_worker(1, 7); // goes idle, no queue yet
        d.add_task(7, tc(1, "a")); // should be assigned straight to worker 1, not queued

        assert_eq!(d.pending_jobs(7), 0);
        assert_eq!(d.busy_count(7), 1);
    }

    #[test]
    fn worker_gone_reports_in_flight_task() {
        let mut d: Dispatcher<BoxFrame> = Dispatcher::new();
        d.register_worker(1, 7);
        let assignment = d.add_task(7, tc(1, "a"));
        if let Assignment::ToWorker { worker_id, task } = assignment {
            d.mark_in_flight(worker_id, task);
        }

        let lost = d.worker_gone(1);
        assert!(lost.is_some());
        assert_eq!(lost.unwrap().task.body, b"a");
    }

    #[test]
    fn worker_gone_while_idle_reports_nothing() {
        let mut d: Dispatcher<BoxFrame> = Dispatcher::new();
        d.register_worker(1, 7);
        assert!(d.worker_gone(1).is_none());
        assert_eq!(d.idle_count(7), 0);
    }

    #[test]
    fn idle_and_busy_are_mutually_exclusive() {
        let mut d: Dispatcher<BoxFrame> = Dispatcher::new();
        d.register_worker(1, 7);
        d.register_worker(2, 7);
        d.add_task(7, tc(1, "a"));

        assert_eq!(d.busy_count(7), 1);
        assert_eq!(d.idle_count(7), 1);
        assert_eq!(d.busy_count(7) + d.idle_count(7), 2);
    }

    #[test]
    fn drop_client_tasks_removes_only_that_clients_queued_work() {
        let mut d: Dispatcher<BoxFrame> = Dispatcher::new();
        d.add_task(7, tc(1, "from-1"));
        d.add_task(7, tc(2, "from-2"));

        d.drop_client_tasks(1);
        assert_eq!(d.pending_jobs(7), 1);

        d.register_worker(1, 7);
        match d.worker_idle(1) {
            Assignment::ToWorker { task, .. } => assert_eq!(task.client_conn_id, 2),
            _ => panic!(),
        }
    }
}
