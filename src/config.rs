//! Tunables for a backdoor session.

use std::time::Duration;

use crate::protocol::{OpcodeTable, SIGNATURE};

/// Timeouts, retry budget and wire constants for one [`Device`](crate::device::Device).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Receive timeout for ordinary commands.
    pub timeout: Duration,
    /// Receive timeout for `blx`, which runs arbitrary code on the target.
    pub blx_timeout: Duration,
    /// Total attempts per command, including the first one.
    pub retry_limit: u32,
    /// Probe attempts during a handshake.
    pub sync_attempts: u32,
    /// Pause between failed handshake probes.
    pub sync_delay: Duration,
    /// How long the line must stay quiet before a drain is considered done.
    pub drain_timeout: Duration,
    /// Largest wordcount accepted by a single `read_block` round trip.
    pub max_block_words: u32,
    pub opcodes: OpcodeTable,
    pub signature: Vec<u8>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            blx_timeout: Duration::from_secs(10),
            retry_limit: 4,
            sync_attempts: 12,
            sync_delay: Duration::from_millis(50),
            drain_timeout: Duration::from_millis(20),
            // Larger blocks get truncated by the SCSI path on real drives.
            max_block_words: 0x1c,
            opcodes: OpcodeTable::default(),
            signature: SIGNATURE.to_vec(),
        }
    }
}

/// Addresses in target RAM that tools are allowed to scribble on.
///
/// These are guesses from watching which DRAM stays untouched by the stock
/// firmware, not anything the hardware guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetLayout {
    /// General purpose scratch area; default load address for hook handlers.
    pub pad: u32,
    /// Buffer for one-shot compiled snippets (`evalc`, `evalasm`).
    pub shell_code: u32,
    /// Virtual address the overlay is parked at while it is being filled.
    pub overlay_scratch: u32,
}

impl Default for TargetLayout {
    fn default() -> Self {
        Self {
            pad: 0x1e0_0000,
            shell_code: 0x1e4_0000,
            overlay_scratch: 0x50_0000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_areas_do_not_overlap_low_flash() {
        let layout = TargetLayout::default();
        assert!(layout.pad > layout.overlay_scratch);
        assert_eq!(layout.pad & 3, 0);
        assert_eq!(layout.shell_code & 3, 0);
        assert!(TransportConfig::default().retry_limit > 0);
    }
}
