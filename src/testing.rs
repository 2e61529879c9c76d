//! Test doubles for the two external tools: a decoder that knows a handful
//! of encodings, and a toolchain that records what it was asked to build.

use std::cell::RefCell;

use crate::code::{CodeEnv, CodeError, Disassembler, Instruction, Library, Mode, Toolchain};
use crate::error::Result;

/// Decodes a small, fixed subset of Thumb and ARM, formatted like capstone.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptedDisassembler;

const CONDITIONS: [&str; 14] = [
    "eq", "ne", "hs", "lo", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le",
];

fn thumb(hw: u16, next: Option<u16>, address: u32) -> Option<(usize, String, String)> {
    let reg = |r: u16| match r {
        13 => "sp".to_string(),
        14 => "lr".to_string(),
        15 => "pc".to_string(),
        r => format!("r{r}"),
    };
    let decoded = match hw {
        0xbf00 => (2, "nop".into(), String::new()),
        0xbe00..=0xbeff => (2, "bkpt".into(), format!("#{:#x}", hw & 0xff)),
        0x0000 => (2, "movs".into(), "r0, r0".into()),
        0x2000..=0x27ff => (2, "movs".into(), format!("r{}, #{:#x}", (hw >> 8) & 7, hw & 0xff)),
        0x4600..=0x46ff => {
            let rd = (hw & 7) | ((hw >> 4) & 8);
            (2, "mov".into(), format!("{}, {}", reg(rd), reg((hw >> 3) & 0xf)))
        }
        0x4700..=0x477f => (2, "bx".into(), reg((hw >> 3) & 0xf)),
        0x4800..=0x4fff => (
            2,
            "ldr".into(),
            format!("r{}, [pc, #{:#x}]", (hw >> 8) & 7, 4 * (hw & 0xff)),
        ),
        0xa000..=0xa7ff => {
            (2, "adr".into(), format!("r{}, #{:#x}", (hw >> 8) & 7, 4 * (hw & 0xff)))
        }
        0xb400..=0xb5ff => (2, "push".into(), "{r4, lr}".into()),
        0xbc00..=0xbdff => (2, "pop".into(), "{r4, pc}".into()),
        0xd000..=0xddff => {
            let offset = ((hw & 0xff) as i8 as i32) * 2;
            let target = (address as i32 + 4 + offset) as u32;
            let cond = CONDITIONS[((hw >> 8) & 0xf) as usize];
            (2, format!("b{cond}"), format!("#{target:#x}"))
        }
        0xe000..=0xe7ff => {
            let offset = (((hw & 0x7ff) << 5) as i16 >> 4) as i32;
            let target = (address as i32 + 4 + offset) as u32;
            (2, "b".into(), format!("#{target:#x}"))
        }
        0xf04f | 0xf44f if next.is_some_and(|n| n & 0x8000 == 0) => {
            let low = next?;
            let imm12 = (((hw >> 10) & 1) << 11) | (((low >> 12) & 7) << 8) | (low & 0xff);
            (4, "mov.w".into(), format!("r{}, #{:#x}", (low >> 8) & 0xf, expand_imm(imm12)))
        }
        0xf000..=0xf7ff => {
            let low = next.filter(|n| *n >= 0xf800 || (0xe800..0xf000).contains(n))?;
            let high = (((hw & 0x7ff) as u32) << 21) as i32 >> 9;
            let offset = high + ((low & 0x7ff) as i32) * 2;
            let target = (address as i32 + 4 + offset) as u32;
            if low >= 0xf800 {
                (4, "bl".into(), format!("#{target:#x}"))
            } else {
                (4, "blx".into(), format!("#{:#x}", target & !3))
            }
        }
        _ => return None,
    };
    Some(decoded)
}

/// Thumb-2 modified immediate.
fn expand_imm(imm12: u16) -> u32 {
    let imm8 = (imm12 & 0xff) as u32;
    match imm12 >> 8 {
        0 => imm8,
        1 => imm8 << 16 | imm8,
        2 => imm8 << 24 | imm8 << 8,
        3 => imm8 * 0x0101_0101,
        _ => (0x80 | (imm12 & 0x7f) as u32).rotate_right((imm12 >> 7) as u32),
    }
}

fn arm(word: u32) -> Option<(String, String)> {
    match word {
        0xe1a0_0000 => Some(("mov".into(), "r0, r0".into())),
        w if w & 0xffff_f000 == 0xe59f_f000 => {
            Some(("ldr".into(), format!("pc, [pc, #{:#x}]", w & 0xfff)))
        }
        _ => None,
    }
}

impl Disassembler for ScriptedDisassembler {
    fn disassemble(&self, bytes: &[u8], address: u32, mode: Mode) -> Result<Vec<Instruction>> {
        let mut lines = Vec::new();
        let mut offset = 0;
        match mode {
            Mode::Thumb => {
                let halfword =
                    |at: usize| bytes.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]));
                while let Some(hw) = halfword(offset) {
                    let at = address + offset as u32;
                    let Some((len, mnemonic, operands)) = thumb(hw, halfword(offset + 2), at) else {
                        break;
                    };
                    lines.push(Instruction {
                        address: at,
                        bytes: bytes[offset..offset + len].to_vec(),
                        mnemonic,
                        operands,
                        mode,
                    });
                    offset += len;
                }
            }
            Mode::Arm => {
                for chunk in bytes.chunks_exact(4) {
                    let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let Some((mnemonic, operands)) = arm(word) else {
                        break;
                    };
                    lines.push(Instruction {
                        address: address + offset as u32,
                        bytes: chunk.to_vec(),
                        mnemonic,
                        operands,
                        mode,
                    });
                    offset += 4;
                }
            }
        }
        Ok(lines)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Compile,
    Library,
    Assemble,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: CallKind,
    pub address: u32,
    pub source: String,
    pub mode: Mode,
    pub env: CodeEnv,
}

/// Pretends to build everything into `code_len` bytes of 0xa5.
pub struct RecordingToolchain {
    calls: RefCell<Vec<Call>>,
    code_len: usize,
    reject_values: bool,
    reject_all: bool,
    reject_assembly: Option<String>,
}

impl RecordingToolchain {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            code_len: 12,
            reject_values: false,
            reject_all: false,
            reject_assembly: None,
        }
    }

    /// Fail every compile of a `(uint32_t)(...)` cast, like gcc does for a
    /// statement that has no value.
    pub fn rejecting_values(mut self) -> Self {
        self.reject_values = true;
        self
    }

    /// Fail assembling any source that contains `text`.
    pub fn rejecting_assembly_of(mut self, text: &str) -> Self {
        self.reject_assembly = Some(text.to_string());
        self
    }

    /// Fail every build.
    pub fn failing(mut self) -> Self {
        self.reject_all = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    fn record(
        &self,
        kind: CallKind,
        address: u32,
        source: &str,
        env: &CodeEnv,
        mode: Mode,
    ) -> Result<Vec<u8>> {
        self.calls.borrow_mut().push(Call {
            kind,
            address,
            source: source.to_string(),
            mode,
            env: env.clone(),
        });
        let rejected = self.reject_all
            || (self.reject_values && source.starts_with("(uint32_t)("))
            || (kind == CallKind::Assemble
                && self.reject_assembly.as_deref().is_some_and(|text| source.contains(text)));
        if rejected {
            let file = ("patch.cpp".to_string(), format!("{source}\n"));
            let output = "patch.cpp:1:1: error: void value not ignored";
            return Err(CodeError::new(output, vec![file]).into());
        }
        Ok(vec![0xa5; self.code_len])
    }
}

impl Toolchain for RecordingToolchain {
    async fn compile(
        &self,
        address: u32,
        expression: &str,
        env: &CodeEnv,
        mode: Mode,
    ) -> Result<Vec<u8>> {
        self.record(CallKind::Compile, address, expression, env, mode)
    }

    async fn compile_library(
        &self,
        address: u32,
        functions: &[(String, String)],
        env: &CodeEnv,
        mode: Mode,
    ) -> Result<Library> {
        let source: Vec<String> = functions.iter().map(|(n, e)| format!("{n}: {e}")).collect();
        let code = self.record(CallKind::Library, address, &source.join("\n"), env, mode)?;
        let thumb_bit = (mode == Mode::Thumb) as u32;
        let symbols = functions
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), address + 4 * i as u32 | thumb_bit))
            .collect();
        Ok(Library { code, symbols })
    }

    async fn assemble(
        &self,
        address: u32,
        source: &str,
        env: &CodeEnv,
        mode: Mode,
    ) -> Result<Vec<u8>> {
        self.record(CallKind::Assemble, address, source, env, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_thumb_decoding() {
        let bytes = [0x00, 0xbf, 0x01, 0x48, 0xfe, 0xe7, 0x00, 0xf0, 0x00, 0xf8, 0xff, 0xff];
        let lines = ScriptedDisassembler.disassemble(&bytes, 0x2000, Mode::Thumb).unwrap();
        let text: Vec<String> = lines.iter().map(Instruction::text).collect();
        assert_eq!(text, ["nop", "ldr r0, [pc, #0x4]", "b #0x2004", "bl #0x200a"]);
        assert_eq!(lines[3].len(), 4);
    }

    #[test]
    fn scripted_thumb2_decoding() {
        // mov.w r0, #0x00ff00ff; blx #0x4000 from 0x1004
        let bytes = [0x4f, 0xf0, 0xff, 0x10, 0x02, 0xf0, 0xfc, 0xef];
        let lines = ScriptedDisassembler.disassemble(&bytes, 0x1000, Mode::Thumb).unwrap();
        let text: Vec<String> = lines.iter().map(Instruction::text).collect();
        assert_eq!(text, ["mov.w r0, #0xff00ff", "blx #0x4000"]);
    }
}
