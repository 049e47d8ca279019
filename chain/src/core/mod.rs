//! Deterministic, pure logic shared by the decision loop.
//!
//! Core modules are free of I/O side effects: no threads, clocks or files.
//! They operate on in-memory data and return deterministic outputs suitable
//! for tests.

pub mod observation;
pub mod protocol;
pub mod script;
pub mod status;
pub mod tools;
pub mod tree;
pub mod types;
