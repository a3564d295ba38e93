//! Core library for the rigger CI job executor.
//!
//! A fleet of workers launches one `rigger` process per unit of build
//! work; this crate is everything that happens inside that process:
//!
//! - a phased state machine ([`executor::Executor`]) carrying the job
//!   from environment setup through source checkout, command
//!   execution, artifact upload, and teardown;
//! - externally-scripted [hooks](hook) interleaved with the built-in
//!   phases, with environment and working-directory capture;
//! - a [shell facade](shell) that spawns and supervises user processes
//!   with PTY, signal, and grace-period semantics;
//! - a content-addressed [mirror cache](mirror) of source repositories
//!   with cross-process locking, driven by the self-healing
//!   [checkout engine](checkout);
//! - [plugins](plugin) cloned per agent and contributing hooks;
//! - secret redaction on every output stream (via `rigger-redact`).
//!
//! The control-plane API and telemetry backends stay outside: the
//! executor consumes them as the [`control::ControlPlane`] and
//! [`trace::TraceRecorder`] capabilities.

pub mod checkout;
pub mod config;
pub mod control;
pub mod executor;
pub mod git;
pub mod hook;
pub mod logger;
pub mod mirror;
pub mod plugin;
pub mod shell;
pub mod trace;

pub use config::{JobConfig, Phase};
pub use control::{ControlPlane, NoopControlPlane};
pub use executor::Executor;
pub use logger::JobLogger;
pub use trace::{NoopTraceRecorder, TraceRecorder};
