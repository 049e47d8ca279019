//! Single-chain tool-using agent loop.
//!
//! A model is driven through repeated thought / action / observation turns
//! against a tool environment until the task is solved, the model gives up, or
//! the step budget runs out. Every turn becomes a node in a per-attempt tree so
//! the full chain can be exported for training and evaluation. The
//! architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (tree arena, action parsing,
//!   scriptlet language, status taxonomy). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (sandbox threads, child processes,
//!   model transport, templates, files). Isolated behind traits for tests.
//!
//! Orchestration modules ([`search`], [`export`]) coordinate core logic with
//! I/O to run attempts and produce run-result documents.

pub mod core;
pub mod exit_codes;
pub mod export;
pub mod io;
pub mod logging;
pub mod search;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
