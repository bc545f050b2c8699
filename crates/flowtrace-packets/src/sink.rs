//! Raw packet transmission trait.

use async_trait::async_trait;
use flowtrace_core::TraceError;
use std::net::SocketAddrV4;

/// Trait for transmitting hand-crafted IPv4 datagrams.
///
/// The buffer already contains the full IP header; implementations write
/// it through a raw socket with the header-included option set, in a
/// single syscall, without retrying. Failures come back classified as
/// [`flowtrace_core::SendErrorKind`] inside `TraceError::SendFailure`.
#[async_trait]
pub trait RawSender: Send {
    /// Writes one complete IPv4 packet to the given destination.
    async fn send(&mut self, packet: &[u8], dst: SocketAddrV4) -> Result<(), TraceError>;

    /// Closes the sender. Idempotent.
    async fn close(&mut self) -> Result<(), TraceError>;
}
