//! Error taxonomy shared by every layer of the backdoor stack.
//!
//! Transport-level failures ([`Error::Protocol`], [`Error::Timeout`],
//! [`Error::UnexpectedReply`]) are transient: the [`Device`](crate::device::Device)
//! retries them behind a resynchronisation and only surfaces them wrapped in
//! [`Error::Communication`] once the retry budget runs out. Everything else is
//! raised to the caller immediately.

use crate::code::CodeError;
use crate::protocol::Opcode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The handshake never saw the signature string.
    #[error("no backdoor signature after {attempts} handshake attempts (last seen: {last_seen:?})")]
    Synchronization { attempts: u32, last_seen: String },

    /// A reply frame failed its checksum.
    #[error("{opcode:?} at {address:#010x}: checksum {received:#010x}, expected {expected:#010x}")]
    Protocol {
        opcode: Opcode,
        address: u32,
        expected: u32,
        received: u32,
    },

    #[error("{opcode:?} at {address:#010x}: timed out waiting for {wanted} reply bytes")]
    Timeout {
        opcode: Opcode,
        address: u32,
        wanted: usize,
    },

    #[error("{opcode:?}: unexpected reply byte {byte:#04x}")]
    UnexpectedReply { opcode: Opcode, byte: u8 },

    #[error("{0:?} decoded into the wrong kind of reply")]
    MismatchedReply(Opcode),

    /// Retries exhausted. `source` is the last transient failure seen.
    #[error("{opcode:?} at {address:#010x} failed after {attempts} attempts")]
    Communication {
        opcode: Opcode,
        address: u32,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("address {address:#010x} must be {required}-byte aligned")]
    Alignment { address: u32, required: u32 },

    #[error("block read of {wordcount} words exceeds the {max} word limit per round trip")]
    BlockTooLarge { wordcount: u32, max: u32 },

    #[error("overlay of {wordcount} words at {address:#010x} is outside the mappable range")]
    OverlayRange { address: u32, wordcount: u32 },

    #[error("vector at {address:#010x} is not an indirect `ldr pc` shim: {instruction}")]
    VectorNotIndirect { address: u32, instruction: String },

    #[error("can't relocate `{instruction}` at {address:#010x}: {reason}")]
    UnsupportedRelocation {
        address: u32,
        instruction: String,
        reason: &'static str,
    },

    #[error("hook at {address:#010x} did not take effect, no trap found in:\n{disassembly}")]
    HookVerification { address: u32, disassembly: String },

    #[error(transparent)]
    Compile(#[from] CodeError),

    #[error("disassembly failed: {0}")]
    Disassembly(String),

    #[error("link is closed")]
    LinkClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),

    #[error("SCSI transport failure: {0}")]
    Scsi(color_eyre::Report),
}

impl Error {
    /// Whether the retry wrapper may resynchronise and try the command again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Protocol { .. } | Error::Timeout { .. } | Error::UnexpectedReply { .. }
        )
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_frame_level_failures_are_transient() {
        let checksum = Error::Protocol {
            opcode: Opcode::Peek,
            address: 0x1000,
            expected: 1,
            received: 2,
        };
        assert!(checksum.is_transient());
        assert!(!Error::Alignment { address: 2, required: 4 }.is_transient());
        assert!(
            !Error::Communication {
                opcode: Opcode::Peek,
                address: 0,
                attempts: 3,
                source: Box::new(checksum),
            }
            .is_transient()
        );
    }
}
