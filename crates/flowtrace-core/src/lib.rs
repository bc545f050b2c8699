//! Core types, traits, and the probe engine for flowtrace.
//!
//! This crate provides the fundamental abstractions used throughout the
//! multipath traceroute implementation:
//!
//! - [`ProbeDriver`] trait for protocol implementations
//! - [`ProbeEngine`] driving the ttl x flow x round probe matrix
//! - [`TraceError`] for error handling
//! - [`TracerouteResult`] and its derived statistics

pub mod engine;
pub mod error;
pub mod result;
pub mod stats;
pub mod traits;
pub mod types;

pub use engine::ProbeEngine;
pub use error::{BuildError, SendErrorKind, TraceError};
pub use result::{FlowRecord, HopResult, TracerouteResult};
pub use stats::{HopStats, NetworkAnalysis, Path, PathHop};
pub use traits::{ProbeDriver, ProbeDriverInfo, ProbeReply, ReverseResolver};
pub use types::{ProbeParams, Protocol};
