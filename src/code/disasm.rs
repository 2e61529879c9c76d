//! Disassembly of target code, and the few instruction-level facts the
//! hook engine and the vector table helpers need from it.

use std::fmt;

use capstone::prelude::*;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::link::Link;
use crate::memory;
use crate::protocol::le32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Arm,
    Thumb,
}

/// One decoded instruction, in unified assembler syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u32,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operands: String,
    pub mode: Mode,
}

impl Instruction {
    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Address of the following instruction.
    pub fn end(&self) -> u32 {
        self.address + self.len()
    }

    /// Mnemonic without a `.w` / `.n` width qualifier.
    pub fn base_mnemonic(&self) -> &str {
        self.mnemonic
            .strip_suffix(".w")
            .or_else(|| self.mnemonic.strip_suffix(".n"))
            .unwrap_or(&self.mnemonic)
    }

    /// `mnemonic operands`, as it would be written in an assembly source.
    pub fn text(&self) -> String {
        if self.operands.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, self.operands)
        }
    }

    /// Register names and other words in the operand list.
    pub fn operand_tokens(&self) -> impl Iterator<Item = &str> {
        self.operands
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}\t{}\t{}", self.address, self.mnemonic, self.operands)?;
        if let Some(literal) = ldrpc_source_address(self) {
            write!(f, "\t; ({literal:#010x})")?;
        }
        Ok(())
    }
}

pub trait Disassembler {
    /// Decode `bytes` as if loaded at `address`. Stops at the first
    /// undecodable instruction.
    fn disassemble(&self, bytes: &[u8], address: u32, mode: Mode) -> Result<Vec<Instruction>>;
}

/// ARMv5TE-era decoder on top of capstone.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapstoneDisassembler;

impl Disassembler for CapstoneDisassembler {
    fn disassemble(&self, bytes: &[u8], address: u32, mode: Mode) -> Result<Vec<Instruction>> {
        let arch_mode = match mode {
            Mode::Arm => arch::arm::ArchMode::Arm,
            Mode::Thumb => arch::arm::ArchMode::Thumb,
        };
        let cs = Capstone::new()
            .arm()
            .mode(arch_mode)
            .build()
            .map_err(|e| Error::Disassembly(e.to_string()))?;
        let insns = cs
            .disasm_all(bytes, address as u64)
            .map_err(|e| Error::Disassembly(e.to_string()))?;
        Ok(insns
            .iter()
            .map(|insn| Instruction {
                address: insn.address() as u32,
                bytes: insn.bytes().to_vec(),
                mnemonic: insn.mnemonic().unwrap_or("<unknown>").to_string(),
                operands: insn.op_str().unwrap_or("").to_string(),
                mode,
            })
            .collect())
    }
}

/// Read `size` bytes of target memory and disassemble them.
pub async fn disassemble<L: Link>(
    device: &mut Device<L>,
    disassembler: &impl Disassembler,
    address: u32,
    size: u32,
    mode: Mode,
) -> Result<Vec<Instruction>> {
    let bytes = memory::read_block(device, address, size).await?;
    disassembler.disassemble(&bytes, address, mode)
}

/// Disassemble `size` bytes on either side of `address`, making sure one of
/// the decoded instructions starts exactly at `address`.
///
/// Thumb decoding that starts mid-instruction is retried one halfword later.
pub async fn disassemble_context<L: Link>(
    device: &mut Device<L>,
    disassembler: &impl Disassembler,
    address: u32,
    size: u32,
    mode: Mode,
) -> Result<Vec<Instruction>> {
    let address = address & !1;
    let size = (size + 3) & !3;
    let start = address.wrapping_sub(size);
    let block = memory::read_block(device, start, size * 2).await?;

    let lines = disassembler.disassemble(&block, start, mode)?;
    if lines.iter().any(|l| l.address == address) {
        return Ok(lines);
    }
    if mode == Mode::Thumb && block.len() >= 4 {
        let lines = disassembler.disassemble(&block[2..block.len() - 2], start + 2, mode)?;
        if lines.iter().any(|l| l.address == address) {
            return Ok(lines);
        }
    }
    Err(Error::Disassembly(format!(
        "no instruction boundary at {address:#010x} in context:\n{}",
        listing(&lines)
    )))
}

pub fn listing(lines: &[Instruction]) -> String {
    lines
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Two listings next to each other, one row per address.
pub fn side_by_side(left: &[Instruction], right: &[Instruction]) -> String {
    let cell = |l: &Instruction| format!("{}\t{}", l.mnemonic, l.operands).replace('\t', "  ");
    let width = left.iter().map(|l| cell(l).len()).max().unwrap_or(0);
    let mut rows = Vec::new();
    let (mut i, mut j) = (0, 0);
    loop {
        let (l, r) = (left.get(i), right.get(j));
        let (take_left, take_right, address) = match (l, r) {
            (Some(l), Some(r)) if l.address < r.address => (true, false, l.address),
            (Some(l), Some(r)) if r.address < l.address => (false, true, r.address),
            (Some(l), Some(_)) => (true, true, l.address),
            (Some(l), None) => (true, false, l.address),
            (None, Some(r)) => (false, true, r.address),
            (None, None) => break,
        };
        let left_text = l.filter(|_| take_left).map(cell).unwrap_or_default();
        let right_text = r.filter(|_| take_right).map(cell).unwrap_or_default();
        rows.push(format!("{address:08x} {left_text:<width$} {right_text}").trim_end().to_string());
        i += take_left as usize;
        j += take_right as usize;
    }
    rows.join("\n")
}

/// Absolute address a `ldr rX, [pc, #n]` loads from.
pub fn ldrpc_source_address(line: &Instruction) -> Option<u32> {
    if line.base_mnemonic() != "ldr" {
        return None;
    }
    let (_, mem) = line.operands.split_once(", ")?;
    let inner = mem.strip_prefix("[pc")?.strip_suffix(']')?;
    let offset = match inner.trim_start_matches(',').trim() {
        "" => 0i64,
        imm => {
            let imm = imm.strip_prefix('#')?;
            match imm.strip_prefix('-') {
                Some(neg) => -(parse_int::parse::<u32>(neg).ok()? as i64),
                None => parse_int::parse::<u32>(imm).ok()? as i64,
            }
        }
    };
    let pc = match line.mode {
        Mode::Thumb => (line.address + 4) & !3,
        Mode::Arm => line.address + 8,
    };
    Some((pc as i64 + offset) as u32)
}

/// The word a `ldr rX, [pc, #n]` would load.
pub async fn ldrpc_source_word<L: Link>(
    device: &mut Device<L>,
    line: &Instruction,
) -> Result<Option<u32>> {
    let Some(address) = ldrpc_source_address(line) else {
        return Ok(None);
    };
    // ARM literals need not be word aligned.
    let bytes = memory::read_block(device, address, 4).await?;
    Ok(Some(le32(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(address: u32, mnemonic: &str, operands: &str, mode: Mode) -> Instruction {
        Instruction {
            address,
            bytes: vec![0; if mode == Mode::Arm { 4 } else { 2 }],
            mnemonic: mnemonic.into(),
            operands: operands.into(),
            mode,
        }
    }

    #[test]
    fn capstone_decodes_thumb_nop_and_bkpt() {
        let lines = CapstoneDisassembler
            .disassemble(&[0x00, 0xbf, 0xbe, 0xbe], 0x1000, Mode::Thumb)
            .unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].mnemonic, "nop");
        assert_eq!(lines[1].address, 0x1002);
        assert_eq!(lines[1].mnemonic, "bkpt");
        assert_eq!(lines[1].operands, "#0xbe");
    }

    #[test]
    fn capstone_decodes_an_arm_vector_shim() {
        // ldr pc, [pc, #0x18]
        let lines = CapstoneDisassembler
            .disassemble(&0xe59ff018u32.to_le_bytes(), 0x0c, Mode::Arm)
            .unwrap();
        assert_eq!(lines[0].mnemonic, "ldr");
        assert_eq!(ldrpc_source_address(&lines[0]), Some(0x0c + 8 + 0x18));
    }

    #[test]
    fn thumb_literal_addresses_are_word_aligned() {
        let l = line(0x2002, "ldr", "r0, [pc, #4]", Mode::Thumb);
        assert_eq!(ldrpc_source_address(&l), Some(0x2008));
        let l = line(0x2000, "ldr.w", "r1, [pc, #-0x10]", Mode::Thumb);
        assert_eq!(ldrpc_source_address(&l), Some(0x1ff4));
        assert_eq!(ldrpc_source_address(&line(0x2000, "ldr", "r0, [sp, #4]", Mode::Thumb)), None);
        assert_eq!(ldrpc_source_address(&line(0x2000, "str", "r0, [pc, #4]", Mode::Thumb)), None);
    }

    #[test]
    fn side_by_side_aligns_addresses() {
        let left = vec![
            line(0x1000, "nop", "", Mode::Thumb),
            line(0x1002, "movs", "r0, r0", Mode::Thumb),
        ];
        let right = vec![
            line(0x1000, "bkpt", "#0xbe", Mode::Thumb),
            line(0x1004, "nop", "", Mode::Thumb),
        ];
        let text = side_by_side(&left, &right);
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].starts_with("00001000 nop"));
        assert!(rows[0].ends_with("bkpt  #0xbe"));
        assert!(rows[1].starts_with("00001002 movs  r0, r0"));
        assert!(rows[2].starts_with("00001004"));
        assert!(rows[2].ends_with("nop"));
    }
}
