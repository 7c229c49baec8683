//! Agent orchestration engine.
//!
//! A model proposes actions; conductor validates and dispatches them, runs
//! follow-up hooks, and records every invocation. On top of that sit a
//! bounded tool-calling loop and a plan/generate/test/debug/commit workflow.
//!
//! - **[`core`]**: plain data and pure logic (messages, results, plans,
//!   parsing, task lifecycle). No I/O.
//! - **[`io`]**: side effects behind traits (workspace, processes, git,
//!   connector, logs, config) so tests can substitute them.
//! - **[`tools`]**, **[`hooks`]**: registry, dispatcher and hook map.
//! - **[`agent`]**, **[`workflow`]**, **[`rpc`]**: orchestration built on the above,
//!   wired together by [`runtime::Runtime`].

pub mod agent;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod hooks;
pub mod io;
pub mod logging;
pub mod rpc;
pub mod runtime;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
pub mod workflow;
