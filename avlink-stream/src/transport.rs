//! The transport seam.

use crate::error::TransportError;

/// Outbound half of a serial or TCP link to one device.
///
/// The engine never opens ports itself. Whoever owns the link pushes inbound
/// chunks and connection changes into a [`crate::Session`] and hands it a
/// `Transport` for writes. Writes are fire-and-forget: responses arrive later
/// through [`crate::Session::on_data`].
pub trait Transport: Send + Sync {
    /// Queue bytes for transmission without waiting for the device.
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;
}
