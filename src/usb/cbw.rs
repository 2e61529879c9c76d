//! A USB packet containing a command block wrapper and associated
//! information.

use crate::scsi::command::CommandBlock;
use color_eyre::eyre::ensure;

/// Signature that identifies a packet as a CBW.
///
/// This packet contains the below magic number (little endian).
///
/// See USB Mass Storage Class - Bulk Only Transport, section 5
const CBW_SIGNATURE: u32 = 0x43425355;
/// Signature that identifies a packet as a CSW.
///
/// The packet will start with the below magic number (little endian).
const CSW_SIGNATURE: u32 = 0x53425355;

/// A command block wrapper is *always* 31 bytes in size
pub const CBW_SIZE: usize = 31;
/// A command status wrapper is *always* 13 bytes in size
pub const CSW_SIZE: usize = 13;

/// Maximum length of the `CBWCB` field.
pub const MAX_CDB_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CBWDirection {
    /// Data-Out: from host to the device
    DataOut,
    /// Data-In: from the device to the host
    DataIn,
    /// For when the CBW has a data transfer length of zero.
    ///
    /// According to the spec, the direction bit is ignored entirely if the data
    /// transfer length field is zero, so it exists in the enum purely as an abstraction
    NonDirectional,
}

impl CBWDirection {
    /// `bmCBWFlags`: bit 7 set means Data-In, everything else is reserved.
    fn flags(self) -> u8 {
        match self {
            CBWDirection::DataIn => 0x80,
            CBWDirection::DataOut | CBWDirection::NonDirectional => 0x00,
        }
    }
}

/// The CBW wraps an SCSI command.
///
/// The CBW is always exactly 31 bytes in size, and in little endian format.
///
/// Spec info can be found in the USB Mass Storage Class - Bulk Only Transport document,
/// section 5.
pub struct CommandBlockWrapper {
    /// `dCBWTag` - "A Command Block Tag sent by the host. The device shall echo
    /// the contents of this field back to the host in the [tag] field of the associated CSW.
    /// The [tag] positvely associates a CSW with the corrosponding CBW"
    ///
    /// See [`TagGenerator`] for tooling.
    pub tag: u32,
    /// `dCBWDataTransferLength` - "The number of bytes that the host expects
    /// to transfer on the Bulk-In or Bulk-Out endpoint (as indicated by the
    /// *Direction* bit) during the execution of this command."
    pub data_transfer_length: u32,
    /// `bmCBWFlags` - direction of the data stage.
    pub direction: CBWDirection,
    /// `bCBWLUN` - Multiple LUNs are not supported, so this field is always zero.
    pub lun: u8,
    /// `CBWCB` - "The command block to be executed by the device." Only the
    /// first `command_len` bytes are significant.
    pub command: [u8; MAX_CDB_SIZE],
    pub command_len: u8,
}

impl CommandBlockWrapper {
    /// Creates a new [`CommandBlockWrapper`].
    pub fn new(command: &CommandBlock, tag: u32) -> Self {
        Self {
            tag,
            data_transfer_length: command.data_transfer_len,
            direction: command.direction,
            lun: 0,
            command: command.get(),
            command_len: command.len() as u8,
        }
    }

    /// Serializes the wrapper into exactly [`CBW_SIZE`] bytes.
    pub fn to_bytes(&self) -> [u8; CBW_SIZE] {
        let mut out = [0u8; CBW_SIZE];
        out[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        out[4..8].copy_from_slice(&self.tag.to_le_bytes());
        out[8..12].copy_from_slice(&self.data_transfer_length.to_le_bytes());
        out[12] = self.direction.flags();
        out[13] = self.lun;
        out[14] = self.command_len;
        out[15..].copy_from_slice(&self.command);
        out
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CommandStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

/// A packet containing the status/return value of a command block executed by the USB device.
#[derive(Copy, Clone, Debug)]
pub struct CommandStatusWrapper {
    /// `dCSWTag` - "The device shall set this field to the value received in the *dCBWTag* of
    /// the associated CBW."
    pub tag: u32,
    /// `dCSWDataResidue` - the difference between the amount of data expected as stated
    /// in the *dCBWDataTransferLength* and the actual amount of relevant data processed
    /// by the device.
    pub data_residue: u32,
    /// `bCSWStatus`
    ///
    /// | Value | Description                    |
    /// | ----- | ------------------------------ |
    /// | 0x00  | Command Passed ("good status") |
    /// | 0x01  | Command Failed                 |
    /// | 0x02  | Phase Error                    |
    /// | _     | All other values are reserved  |
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    /// Parse the provided slice into a command status wrapper.
    ///
    /// This function validates the length, the `signature` and the status byte.
    pub fn from_slice(buf: &[u8]) -> color_eyre::Result<CommandStatusWrapper> {
        ensure!(
            buf.len() == CSW_SIZE,
            "provided buffer *must* be CSW_SIZE bytes, was instead {}",
            buf.len()
        );
        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        ensure!(
            signature == CSW_SIGNATURE,
            "invalid magic number for command status wrapper, should be 0x53425355, is 0x{:X}",
            signature
        );
        let status = match buf[12] {
            0 => CommandStatus::Passed,
            1 => CommandStatus::Failed,
            2 => CommandStatus::PhaseError,
            other => color_eyre::eyre::bail!(
                "the command status field is invalid, should be in 0..=2, was {other}"
            ),
        };

        Ok(CommandStatusWrapper {
            tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_residue: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            status,
        })
    }
}

/// Used for generating unique-ish command block tags.
pub struct TagGenerator(u32);

impl TagGenerator {
    /// Initialize the tag generator.
    pub fn new() -> TagGenerator {
        // 123 was chosen as a distinct, human-readable pattern to differentiate it from the rest
        // of the packet
        Self(123)
    }

    /// Returns a unique-ish u32 that's different from the previously returned value.
    pub fn tag(&mut self) -> u32 {
        let output = self.0;
        self.0 = self.0.wrapping_add(1);
        output
    }
}
