//! Test doubles for geoflow components.
//!
//! This module provides:
//! - [`ScriptedRunner`]: a command runner that records invocations and
//!   writes the files a script declares
//! - [`MemorySource`]: an artifact source with range support and
//!   injectable interruptions
//! - [`HttpTestServer`]: a minimal in-process HTTP server for the
//!   `reqwest` paths

mod http;
mod runner;
mod source;

pub use http::{HttpTestServer, RecordedRequest, TestResponse};
pub use runner::{Script, ScriptedRunner};
pub use source::MemorySource;
