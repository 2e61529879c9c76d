//! Byte channels that can carry the backdoor protocol.
//!
//! A [`Link`] knows nothing about frames or checksums; it moves bytes and
//! reports silence. [`Device`](crate::device::Device) builds the protocol on top.

pub mod scsi;
pub mod serial;

pub use scsi::{ScsiLink, ScsiLinkConfig};
pub use serial::SerialLink;

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// A full-duplex, unframed byte pipe to the backdoor firmware.
pub trait Link {
    /// Queue `bytes` for the target. Returns once they are handed to the channel.
    fn send(&mut self, bytes: &[u8]) -> impl Future<Output = Result<()>>;

    /// Receive up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` when nothing arrived within `timeout`; never blocks
    /// longer than that.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration)
    -> impl Future<Output = Result<usize>>;

    /// Release the underlying channel. Further calls fail with
    /// [`Error::LinkClosed`](crate::Error::LinkClosed).
    fn close(&mut self) -> impl Future<Output = Result<()>>;
}
