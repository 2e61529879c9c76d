//! Host side of the MT1939 backdoor.
//!
//! Layers, bottom up:
//!
//! - [`link`]: byte pipes to the firmware (bit-bang serial, or tunnelled
//!   through vendor SCSI commands over [`usb`] and [`scsi`]).
//! - [`device`]: the framed, checksummed command protocol with handshake and
//!   retry. [`protocol`] holds the frame codec.
//! - [`memory`]: arbitrary byte ranges on top of word commands.
//! - [`code`]: compiling, loading and calling code on the target.
//! - [`memmap`]: the overlay window and the vector table.
//! - [`hook`]: live hooks in flash built from all of the above.
//!
//! [`sim`] is an in-process target for tests and dry runs.

pub mod code;
pub mod config;
pub mod device;
pub mod error;
pub mod hook;
pub mod link;
pub mod memmap;
pub mod memory;
pub mod protocol;
pub mod scsi;
pub mod sim;
pub mod usb;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
