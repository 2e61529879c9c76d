//! Representations for SCSI commands and responses.
//!
//! This module uses the term "command descriptor" to describe a struct and implementation specific
//! details behind a CDB, and uses the term "command block" to describe a "black box" containing
//! a valid CDB.
//!
//! Commands are exposed as a function that returns a [`CommandBlock`]. These functions wrap
//! the more granular [`X6CommandDescriptor`] and [`X12CommandDescriptor`] structs.

use super::command_descriptor::*;
use crate::{
    scsi::response::{ResponseParser, inquiry_response, no_response, raw_response},
    usb::cbw::{CBWDirection, MAX_CDB_SIZE},
};

/// A serialized command block ready to be submitted
pub struct CommandBlock {
    command: Vec<u8>,
    pub direction: CBWDirection,
    pub data_transfer_len: u32,
    pub response_parser: ResponseParser,
}

impl CommandBlock {
    /// Returns the length of the underlying command block.
    ///
    /// Will always be at most 16 bytes.
    pub fn len(&self) -> usize {
        self.command.len()
    }

    /// Returns a valid command block, prepared as described by USB Mass
    /// Storage Class - Bulk Only Transport section 5.1 (CBWCB).
    pub fn get(&self) -> [u8; MAX_CDB_SIZE] {
        let mut output_buf: [u8; MAX_CDB_SIZE] = [0; MAX_CDB_SIZE];
        let (subslice, _) = output_buf.split_at_mut(self.command.len());
        subslice.copy_from_slice(&self.command);
        output_buf
    }
}

/// "The TEST UNIT READY command provides a means to check if the logical unit is ready.
///
/// If the logical unit is able to accept an appropriate medium access command without
/// returning CHECK CONDITION status, this command shall return a GOOD status."
///
/// Defined in SPC2 7.25
pub fn test_unit_ready() -> CommandBlock {
    CommandBlock {
        command: X6CommandDescriptor {
            operation_code: OpCode::TestUnitReady,
            logical_block_address: [0, 0, 0],
            misc_len: 0,
            control: 0,
        }
        .to_bytes(),
        direction: CBWDirection::NonDirectional,
        data_transfer_len: 0,
        response_parser: no_response,
    }
}

/// "The INQUIRY command requests that information regarding parameters
/// of the target and a component logical unit be sent to the application client."
///
/// Defined in SPC2 7.3.1 table 45
pub fn inquiry() -> CommandBlock {
    CommandBlock {
        command: X6CommandDescriptor {
            operation_code: OpCode::Inquiry,
            logical_block_address: [0, 0, 0],
            // For inquiry, is ALLOCATION LENGTH,
            // "The standard INQUIRY data shall contain at least 36 bytes"
            // (table 46)
            misc_len: 36,
            control: 0,
        }
        .to_bytes(),
        direction: CBWDirection::DataIn,
        data_transfer_len: 36,
        response_parser: inquiry_response,
    }
}

/// "The PREVENT ALLOW MEDIUM REMOVAL command requests that the target enable or disable
/// the removal of the medium in the logical unit."
///
/// Defined in SPC2 7.12. Many drives reject it; hosts send it anyway.
pub fn prevent_allow_medium_removal() -> CommandBlock {
    CommandBlock {
        command: X6CommandDescriptor {
            operation_code: OpCode::PreventAllowMediumRemoval,
            logical_block_address: [0, 0, 0],
            // PREVENT = 01b, medium removal is prohibited
            misc_len: 1,
            control: 0,
        }
        .to_bytes(),
        direction: CBWDirection::NonDirectional,
        data_transfer_len: 0,
        response_parser: no_response,
    }
}

/// Push `len` bytes of backdoor stream to the firmware patch (Data-Out).
pub fn backdoor_write(opcode: u8, len: u32) -> CommandBlock {
    backdoor(opcode, len, CBWDirection::DataOut)
}

/// Pull up to `len` bytes of backdoor stream from the firmware patch (Data-In).
///
/// The drive always returns `len` bytes; the CSW residue says how many of
/// them are real.
pub fn backdoor_read(opcode: u8, len: u32) -> CommandBlock {
    backdoor(opcode, len, CBWDirection::DataIn)
}

fn backdoor(opcode: u8, len: u32, direction: CBWDirection) -> CommandBlock {
    CommandBlock {
        command: X12CommandDescriptor {
            operation_code: OpCode::Vendor(opcode),
            misc_info: 0,
            logical_block_address: [0; 4],
            length: len.to_be_bytes(),
            misc: 0,
            control: 0,
        }
        .to_bytes(),
        direction,
        data_transfer_len: len,
        response_parser: raw_response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_command_block() {
        // Ensures that a single byte is packed successfully
        let cb = CommandBlock {
            command: vec![1],
            direction: CBWDirection::NonDirectional,
            data_transfer_len: 0,
            response_parser: no_response,
        };
        let mut serialized_cb = cb.get().into_iter();
        assert!(serialized_cb.next() == Some(1));
        assert!(serialized_cb.all(|b| b == 0));
    }

    #[test]
    fn backdoor_blocks_carry_direction_and_length() {
        let out = backdoor_write(0xe0, 7);
        assert_eq!(out.direction, CBWDirection::DataOut);
        assert_eq!(out.data_transfer_len, 7);
        assert_eq!(out.len(), 12);
        assert_eq!(out.get()[0], 0xe0);

        let inb = backdoor_read(0xe1, 64);
        assert_eq!(inb.direction, CBWDirection::DataIn);
        assert_eq!(&inb.get()[6..10], &[0, 0, 0, 64]);
    }
}
