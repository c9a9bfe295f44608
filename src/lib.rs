//! muxd - process session daemon
//!
//! Runs interactive programs inside server-managed PTY sessions exposed over
//! an HTTP API with SSE output streaming, and drives a single-flight queue of
//! one-shot CLI invocations (the "manager").

pub mod activity;
pub mod api;
pub mod broker;
pub mod config;
pub mod manager;
pub mod pty;
pub mod reaper;
pub mod sentinel;
pub mod session;
