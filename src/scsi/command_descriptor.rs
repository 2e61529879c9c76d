//! Underlying structures that commands are issued in

/// Operation codes for a Command Descriptor Block, specifying what operation you want
/// to do as described in 7.1 of SPC-2.
///
/// This enum is not complete, and is intended to grow
/// as needed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OpCode {
    /// SPC-2 7.25
    TestUnitReady,
    /// SPC-2 7.3
    Inquiry,
    /// SPC-2 7.12
    PreventAllowMediumRemoval,
    /// Anything in the vendor-specific range (C0h-FFh), used by the firmware
    /// patch to tunnel the backdoor byte stream.
    Vendor(u8),
}

impl OpCode {
    pub fn code(self) -> u8 {
        match self {
            OpCode::TestUnitReady => 0x00,
            OpCode::Inquiry => 0x12,
            OpCode::PreventAllowMediumRemoval => 0x1e,
            OpCode::Vendor(code) => code,
        }
    }
}

/// As described in SPC-2 4.3.2 table 1, a typical CDB for 6 byte commands.
pub struct X6CommandDescriptor {
    /// This field specifies what command is being issued by the host
    /// to the drive.
    pub operation_code: OpCode,
    /// "A six-byte CDB contains a 21-bit `LOGICAL BLOCK ADDRESS` field."
    /// The last 3 bits are reserved.
    ///
    /// The use of this field varies from command to command.
    pub logical_block_address: [u8; 3],
    /// Depending on the opcode, this field is one of `TRANSFER LENGTH`,
    /// `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`.
    ///
    /// More info can be found in SCSI SPC2 4.3
    pub misc_len: u8,
    /// "The contents of the `CONTROL` field are defined in SAM-2."
    ///
    /// As far as I can tell, this value is set to zero by most modern implementations.
    pub control: u8,
}

impl CommandDescriptor for X6CommandDescriptor {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.operation_code.code()];
        out.extend_from_slice(&self.logical_block_address);
        out.push(self.misc_len);
        out.push(self.control);
        out
    }
}

/// As described in SPC-2 4.3.2 table 3, a typical CDB for 12 byte commands.
///
/// The backdoor commands use this shape with a vendor opcode; the firmware
/// only looks at the opcode and the transfer length.
pub struct X12CommandDescriptor {
    pub operation_code: OpCode,
    /// "Miscellaneous CDB information" (last 5 bits)
    pub misc_info: u8,
    pub logical_block_address: [u8; 4],
    /// `TRANSFER LENGTH`, `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`,
    /// big endian like every other multi-byte CDB field.
    pub length: [u8; 4],
    pub misc: u8,
    pub control: u8,
}

impl CommandDescriptor for X12CommandDescriptor {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.operation_code.code(), self.misc_info];
        out.extend_from_slice(&self.logical_block_address);
        out.extend_from_slice(&self.length);
        out.push(self.misc);
        out.push(self.control);
        out
    }
}

pub trait CommandDescriptor {
    /// Serialized CDB, exactly as long as the descriptor format.
    fn to_bytes(&self) -> Vec<u8>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_sizes_match_spc2() {
        let x6 = X6CommandDescriptor {
            operation_code: OpCode::Inquiry,
            logical_block_address: [0; 3],
            misc_len: 36,
            control: 0,
        };
        assert_eq!(x6.to_bytes(), [0x12, 0, 0, 0, 36, 0]);

        let x12 = X12CommandDescriptor {
            operation_code: OpCode::Vendor(0xe0),
            misc_info: 0,
            logical_block_address: [0; 4],
            length: 0x200u32.to_be_bytes(),
            misc: 0,
            control: 0,
        };
        let bytes = x12.to_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes[0], 0xe0);
        assert_eq!(&bytes[6..10], &[0, 0, 2, 0]);
    }
}
