//! Platform-specific packet I/O implementations.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod darwin;

use crate::SourceSinkHandle;
use flowtrace_core::TraceError;
use std::net::Ipv4Addr;

/// Creates a capture source and raw sender for the current platform.
pub async fn new_source_sink(_target_addr: Ipv4Addr) -> Result<SourceSinkHandle, TraceError> {
    #[cfg(target_os = "linux")]
    return linux::new_source_sink(_target_addr).await;

    #[cfg(target_os = "macos")]
    return darwin::new_source_sink(_target_addr).await;

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    Err(TraceError::NoCapability(
        "raw packet I/O is not supported on this platform".to_string(),
    ))
}
