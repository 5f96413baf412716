//! Shared framing and protocol constants for `relayd`.
//!
//! This crate is deliberately thin: it defines the [`Frame`] trait and a
//! default implementation ([`BoxFrame`]), the environment-variable
//! contract used to tell a freshly spawned child process its role, the
//! protocol-level command/status constants, and the JSON admin payload
//! shapes. Everything that actually routes or dispatches frames lives in
//! `relayd-core`.

pub mod admin;
pub mod constants;
pub mod env;
pub mod frame;

pub use env::{ChildProcessEnv, ProcKind};
pub use frame::{BoxFrame, ControlFrame, Frame, Parsed};
