//! Wire format of the backdoor command channel.
//!
//! Every command is framed as
//!
//! ```text
//! 55 00 <opcode> <address:le32> [payload:le32 ...]
//! ```
//!
//! and every reply (except `exit`) ends in a 32-bit check word that combines the
//! last data word with the last address the firmware touched. Bytes the
//! firmware does not expect send it back to printing its signature line, which
//! is what the handshake relies on.

use crate::error::{Error, Result};

/// Two byte sync header in front of every command.
pub const FRAME_HEADER: [u8; 2] = [0x55, 0x00];

/// Line printed by the firmware whenever it sees a byte it doesn't expect.
pub const SIGNATURE: &[u8] = b"~MeS`14 [bitbang]\r\n";

/// Any byte other than 0x55 provokes a signature line.
pub const PROBE: u8 = b'\n';

/// Reply to a successful `exit`.
pub const EXIT_ACK: u8 = 0x55;

/// The abstract operations of the protocol. Byte values live in [`OpcodeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Peek,
    Poke,
    PeekByte,
    PokeByte,
    Blx,
    ReadBlock,
    FillWords,
    FillBytes,
    Exit,
}

/// Opcode bytes for one firmware revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeTable {
    pub peek: u8,
    pub poke: u8,
    pub peek_byte: u8,
    pub poke_byte: u8,
    pub blx: u8,
    pub read_block: u8,
    pub fill_words: u8,
    pub fill_bytes: u8,
    pub exit: u8,
}

impl OpcodeTable {
    /// Opcodes used by the bit-bang backdoor stub.
    pub const BITBANG: OpcodeTable = OpcodeTable {
        peek: 0xf0,
        poke: 0xe1,
        peek_byte: 0xd2,
        poke_byte: 0xc3,
        blx: 0xb4,
        read_block: 0xa5,
        fill_words: 0x96,
        fill_bytes: 0x78,
        exit: 0x87,
    };

    pub fn code(&self, opcode: Opcode) -> u8 {
        match opcode {
            Opcode::Peek => self.peek,
            Opcode::Poke => self.poke,
            Opcode::PeekByte => self.peek_byte,
            Opcode::PokeByte => self.poke_byte,
            Opcode::Blx => self.blx,
            Opcode::ReadBlock => self.read_block,
            Opcode::FillWords => self.fill_words,
            Opcode::FillBytes => self.fill_bytes,
            Opcode::Exit => self.exit,
        }
    }

    pub fn lookup(&self, code: u8) -> Option<Opcode> {
        [
            Opcode::Peek,
            Opcode::Poke,
            Opcode::PeekByte,
            Opcode::PokeByte,
            Opcode::Blx,
            Opcode::ReadBlock,
            Opcode::FillWords,
            Opcode::FillBytes,
            Opcode::Exit,
        ]
        .into_iter()
        .find(|op| self.code(*op) == code)
    }
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self::BITBANG
    }
}

/// One request, alive for the duration of a single round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Peek { address: u32 },
    Poke { address: u32, word: u32 },
    PeekByte { address: u32 },
    PokeByte { address: u32, byte: u8 },
    Blx { address: u32, r0: u32 },
    ReadBlock { address: u32, wordcount: u32 },
    FillWords { address: u32, pattern: u32, wordcount: u32 },
    FillBytes { address: u32, pattern: u8, bytecount: u32 },
    Exit,
}

/// Decoded, checksum-verified reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Word(u32),
    Byte(u8),
    Ack,
    Registers { r0: u32, r1: u32 },
    Block(Vec<u8>),
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Peek { .. } => Opcode::Peek,
            Command::Poke { .. } => Opcode::Poke,
            Command::PeekByte { .. } => Opcode::PeekByte,
            Command::PokeByte { .. } => Opcode::PokeByte,
            Command::Blx { .. } => Opcode::Blx,
            Command::ReadBlock { .. } => Opcode::ReadBlock,
            Command::FillWords { .. } => Opcode::FillWords,
            Command::FillBytes { .. } => Opcode::FillBytes,
            Command::Exit => Opcode::Exit,
        }
    }

    pub fn address(&self) -> u32 {
        match *self {
            Command::Peek { address }
            | Command::Poke { address, .. }
            | Command::PeekByte { address }
            | Command::PokeByte { address, .. }
            | Command::Blx { address, .. }
            | Command::ReadBlock { address, .. }
            | Command::FillWords { address, .. }
            | Command::FillBytes { address, .. } => address,
            Command::Exit => 0,
        }
    }

    /// Serialize the full frame, header included.
    pub fn encode(&self, opcodes: &OpcodeTable) -> Vec<u8> {
        let mut frame = Vec::with_capacity(19);
        frame.extend_from_slice(&FRAME_HEADER);
        frame.push(opcodes.code(self.opcode()));
        if let Command::Exit = self {
            return frame;
        }
        frame.extend_from_slice(&self.address().to_le_bytes());
        let payload = match *self {
            Command::Poke { word, .. } => vec![word],
            Command::PokeByte { byte, .. } => vec![byte as u32],
            Command::Blx { r0, .. } => vec![r0],
            Command::ReadBlock { wordcount, .. } => vec![wordcount],
            Command::FillWords { pattern, wordcount, .. } => vec![pattern, wordcount],
            Command::FillBytes { pattern, bytecount, .. } => vec![pattern as u32, bytecount],
            _ => Vec::new(),
        };
        for word in payload {
            frame.extend_from_slice(&word.to_le_bytes());
        }
        frame
    }

    /// Exact number of bytes the firmware sends back for this command.
    pub fn reply_len(&self) -> usize {
        match *self {
            Command::Peek { .. } => 8,
            Command::Poke { .. } | Command::PokeByte { .. } => 4,
            Command::PeekByte { .. } => 5,
            Command::Blx { .. } => 12,
            Command::ReadBlock { wordcount, .. } => 4 * wordcount as usize + 4,
            Command::FillWords { .. } | Command::FillBytes { .. } => 4,
            Command::Exit => 1,
        }
    }

    /// Check word the firmware should append, given the data it returned.
    ///
    /// `data` is the last data word involved in the command, which for
    /// writes is the value written and for reads is the value read.
    pub fn expected_check(&self, data: u32) -> u32 {
        match *self {
            Command::ReadBlock { address, wordcount } => {
                data ^ address.wrapping_add(4 * wordcount)
            }
            Command::FillWords { address, wordcount, .. } => {
                data ^ address.wrapping_add(4 * wordcount)
            }
            Command::FillBytes { address, bytecount, .. } => {
                data ^ address.wrapping_add(bytecount)
            }
            _ => data ^ self.address(),
        }
    }

    /// Validate and decode a complete reply of [`Command::reply_len`] bytes.
    pub fn decode(&self, reply: &[u8]) -> Result<Reply> {
        debug_assert_eq!(reply.len(), self.reply_len());
        if let Command::Exit = self {
            return match reply[0] {
                EXIT_ACK => Ok(Reply::Ack),
                byte => Err(Error::UnexpectedReply {
                    opcode: Opcode::Exit,
                    byte,
                }),
            };
        }

        let (body, check) = reply.split_at(reply.len() - 4);
        let received = le32(check);
        let (data, decoded) = match *self {
            Command::Peek { .. } => {
                let word = le32(body);
                (word, Reply::Word(word))
            }
            Command::PeekByte { .. } => (body[0] as u32, Reply::Byte(body[0])),
            Command::Poke { word, .. } => (word, Reply::Ack),
            Command::PokeByte { byte, .. } => (byte as u32, Reply::Ack),
            Command::Blx { .. } => {
                let r0 = le32(&body[0..4]);
                let r1 = le32(&body[4..8]);
                (r0, Reply::Registers { r0, r1 })
            }
            Command::ReadBlock { .. } => {
                let last = body.chunks_exact(4).last().map(le32).unwrap_or(0);
                (last, Reply::Block(body.to_vec()))
            }
            Command::FillWords { pattern, .. } => (pattern, Reply::Ack),
            Command::FillBytes { pattern, .. } => (pattern as u32, Reply::Ack),
            Command::Exit => unreachable!(),
        };

        let expected = self.expected_check(data);
        if received != expected {
            return Err(Error::Protocol {
                opcode: self.opcode(),
                address: self.address(),
                expected,
                received,
            });
        }
        Ok(decoded)
    }
}

pub(crate) fn le32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
