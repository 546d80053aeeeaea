//! Core domain logic: the KV Directory, Container Driver, Session Registry,
//! Executor, Workspace Gateway, and Reaper components from SPEC_FULL.md §2-4.
//! None of this module depends on axum or any HTTP type; the `http` module
//! is the only consumer.

pub mod driver;
pub mod executor;
pub mod kv;
pub mod reaper;
pub mod registry;
pub mod workspace;
