//! Process-model core for `relayd` (spec.md §2): the master supervisor,
//! the proxy dispatcher, and the worker run loop, plus the pieces they
//! share (configuration, framing helpers, signal tracking, stats, the
//! hot-reload handshake). The embedding application lives in the
//! `relayd` crate one level up; this crate knows nothing about it
//! beyond the `relayd_protocol::Frame` trait and the handler/group
//! router types it's parameterized over.

pub mod config;
pub mod dispatcher;
pub mod handler;
pub mod io;
pub mod master;
pub mod proxy;
pub mod reload;
pub mod signals;
pub mod stats;
pub mod task;
pub mod worker_proc;

pub use config::Config;
pub use handler::{GroupRouter, Handler, Request};
pub use task::{decode_assign_body, ipv4_to_u32, ConnId, Task, TaskContainer, TaskFrame};
pub use worker_proc::HandlerRegistry;
