//! Moving the one instruction a hook displaces into the ISR.
//!
//! The ISR runs the instruction at a different address and in ARM state, so
//! anything that depends on where it executes has to be rewritten or refused.

use std::fmt;

use crate::code::disasm::{self, ldrpc_source_address};
use crate::code::{Instruction, Mode};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::link::Link;

const CONDITIONS: [&str; 17] = [
    "eq", "ne", "cs", "hs", "cc", "lo", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le",
    "al",
];

/// What the ISR executes in place of the displaced instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relocation {
    /// Position independent; reassembled as is.
    Verbatim(String),
    /// A pc-relative literal load, rewritten to use the ISR's own pool.
    LiteralLoad {
        text: String,
        literal_address: u32,
        value: u32,
    },
    /// A `bl`/`blx` to a fixed target, reissued from ARM state as a call
    /// through `lr` so the callee's instruction set is kept.
    Call { text: String, target: u32 },
    /// The handler replaces the instruction.
    Omitted,
}

impl Relocation {
    /// Assembly source for the ISR.
    pub fn text(&self) -> &str {
        match self {
            Relocation::Verbatim(text)
            | Relocation::LiteralLoad { text, .. }
            | Relocation::Call { text, .. } => text,
            Relocation::Omitted => "nop",
        }
    }
}

impl fmt::Display for Relocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

fn unsupported(line: &Instruction, reason: &'static str) -> Error {
    Error::UnsupportedRelocation {
        address: line.address,
        instruction: line.text(),
        reason,
    }
}

fn is_branch(mnemonic: &str) -> bool {
    if matches!(mnemonic, "b" | "bx" | "bxj" | "cbz" | "cbnz" | "tbb" | "tbh") {
        return true;
    }
    let conditional = |prefix: &str| {
        mnemonic
            .strip_prefix(prefix)
            .is_some_and(|cond| CONDITIONS.contains(&cond))
    };
    conditional("bx") || conditional("b")
}

fn is_pc(token: &str) -> bool {
    matches!(token, "pc" | "r15")
}

fn is_sp(token: &str) -> bool {
    matches!(token, "sp" | "r13")
}

/// `line` in ARM-state syntax: width qualifiers only exist in Thumb.
fn arm_text(line: &Instruction) -> String {
    let mnemonic = line.base_mnemonic();
    if line.operands.is_empty() {
        mnemonic.to_string()
    } else {
        format!("{mnemonic} {}", line.operands)
    }
}

/// Entry point of an immediate `bl`/`blx`, Thumb bit set for Thumb callees.
fn call_target(line: &Instruction) -> Option<u32> {
    let mnemonic = line.base_mnemonic();
    if !matches!(mnemonic, "bl" | "blx") {
        return None;
    }
    let target = parse_int::parse::<u32>(line.operands.trim().strip_prefix('#')?).ok()?;
    let thumb_callee = matches!((line.mode, mnemonic), (Mode::Thumb, "bl") | (Mode::Arm, "blx"));
    Some(if thumb_callee { target | 1 } else { target & !3 })
}

/// Refuse instructions that can't run from the ISR.
///
/// A pc-relative literal load is accepted here; it still needs rewriting.
pub fn check_relocatable(line: &Instruction) -> Result<()> {
    let mnemonic = line.base_mnemonic();
    if mnemonic.starts_with("it") {
        return Err(unsupported(line, "IT blocks can't be split"));
    }
    if is_branch(mnemonic) {
        return Err(unsupported(line, "branches can't be relocated"));
    }
    if mnemonic == "adr" {
        return Err(unsupported(line, "adr is pc-relative"));
    }
    if matches!(mnemonic, "push" | "pop") {
        return Err(unsupported(line, "push and pop move sp"));
    }

    let first = line.operand_tokens().next();
    if first.is_some_and(is_pc) {
        return Err(unsupported(line, "writes pc"));
    }
    let literal = ldrpc_source_address(line).is_some();
    if !literal && line.operand_tokens().any(is_pc) {
        return Err(unsupported(line, "reads pc"));
    }
    if line.operands.contains("sp!") || line.operands.contains("r13!") {
        return Err(unsupported(line, "writes back sp"));
    }
    let stores = mnemonic.starts_with("str") || mnemonic.starts_with("stm");
    if first.is_some_and(is_sp) && !stores {
        return Err(unsupported(line, "modifies sp"));
    }
    Ok(())
}

/// Decide how the ISR runs `line`, reading the literal of a pc-relative load.
///
/// With `omit` the instruction is dropped, and nothing is checked.
pub async fn relocate<L: Link>(
    device: &mut Device<L>,
    line: &Instruction,
    omit: bool,
) -> Result<Relocation> {
    if omit {
        return Ok(Relocation::Omitted);
    }
    check_relocatable(line)?;
    if let Some(target) = call_target(line) {
        return Ok(Relocation::Call {
            text: format!("ldr lr, =0x{target:08x}\n    blx lr"),
            target,
        });
    }
    let Some(literal_address) = ldrpc_source_address(line) else {
        return Ok(Relocation::Verbatim(arm_text(line)));
    };
    let value = disasm::ldrpc_source_word(device, line)
        .await?
        .ok_or_else(|| unsupported(line, "unreadable literal"))?;
    let dest = line.operands.split(',').next().unwrap_or_default().trim();
    Ok(Relocation::LiteralLoad {
        text: format!("{} {dest}, =0x{value:08x}", line.base_mnemonic()),
        literal_address,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::sim::SimulatedTarget;

    fn thumb(mnemonic: &str, operands: &str) -> Instruction {
        Instruction {
            address: 0x1000,
            bytes: vec![0; 2],
            mnemonic: mnemonic.into(),
            operands: operands.into(),
            mode: Mode::Thumb,
        }
    }

    fn reason(line: Instruction) -> &'static str {
        match check_relocatable(&line) {
            Err(Error::UnsupportedRelocation { reason, .. }) => reason,
            other => panic!("{} was accepted: {other:?}", line.text()),
        }
    }

    #[test]
    fn ordinary_instructions_relocate() {
        for (m, ops) in [
            ("nop", ""),
            ("movs", "r0, #1"),
            ("adds.w", "r1, r2, r3"),
            ("bl", "#0x4000"),
            ("blx", "r3"),
            ("bic", "r0, r0, #1"),
            ("str", "r0, [sp, #4]"),
            ("ldr", "r1, [sp, #8]"),
            ("ldr", "r0, [pc, #0x4]"),
            ("stm", "r13, {r0, r1}"),
            ("mov", "r0, r12"),
            ("ldr", "r0, [ip, #4]"),
            ("mov", "ip, r0"),
        ] {
            assert!(check_relocatable(&thumb(m, ops)).is_ok(), "{m} {ops}");
        }
    }

    #[test]
    fn control_flow_and_stack_changes_are_refused() {
        assert_eq!(reason(thumb("b", "#0x1000")), "branches can't be relocated");
        assert_eq!(reason(thumb("bne.w", "#0x1040")), "branches can't be relocated");
        assert_eq!(reason(thumb("bls", "#0x1040")), "branches can't be relocated");
        assert_eq!(reason(thumb("bx", "lr")), "branches can't be relocated");
        assert_eq!(reason(thumb("cbz", "r0, #0x1010")), "branches can't be relocated");
        assert_eq!(reason(thumb("tbb", "[r0, r1]")), "branches can't be relocated");
        assert_eq!(reason(thumb("itt", "eq")), "IT blocks can't be split");
        assert_eq!(reason(thumb("adr", "r0, #0x10")), "adr is pc-relative");
        assert_eq!(reason(thumb("push", "{r4, lr}")), "push and pop move sp");
        assert_eq!(reason(thumb("mov", "pc, lr")), "writes pc");
        assert_eq!(reason(thumb("ldr", "pc, [pc, #0x18]")), "writes pc");
        assert_eq!(reason(thumb("add", "r0, pc")), "reads pc");
        assert_eq!(reason(thumb("ldm", "sp!, {r4, r5}")), "writes back sp");
        assert_eq!(reason(thumb("sub", "sp, #8")), "modifies sp");
        assert_eq!(reason(thumb("add", "r13, r13, #4")), "modifies sp");
    }

    #[test]
    fn omitted_instructions_assemble_as_nop() {
        assert_eq!(Relocation::Omitted.text(), "nop");
        assert_eq!(Relocation::Verbatim("movs r0, #1".into()).to_string(), "movs r0, #1");
    }

    async fn relocated(line: Instruction) -> Relocation {
        let mut target = SimulatedTarget::new();
        target.memory_mut().load(0x1008, &0x1234_5678u32.to_le_bytes());
        let mut device = Device::open(target, TransportConfig::default()).await.unwrap();
        relocate(&mut device, &line, false).await.unwrap()
    }

    #[tokio::test]
    async fn thumb_calls_keep_the_callee_in_thumb_state() {
        let bl = Instruction {
            bytes: vec![0; 4],
            ..thumb("bl", "#0x4000")
        };
        assert_eq!(
            relocated(bl).await,
            Relocation::Call {
                text: "ldr lr, =0x00004001\n    blx lr".into(),
                target: 0x4001,
            }
        );

        let blx = Instruction {
            bytes: vec![0; 4],
            ..thumb("blx", "#0x4004")
        };
        assert_eq!(relocated(blx).await.text(), "ldr lr, =0x00004004\n    blx lr");
    }

    #[tokio::test]
    async fn width_qualifiers_are_dropped_for_arm_state() {
        let wide = Instruction {
            bytes: vec![0; 4],
            ..thumb("mov.w", "r0, #0xff00ff")
        };
        assert_eq!(relocated(wide).await, Relocation::Verbatim("mov r0, #0xff00ff".into()));

        let literal = Instruction {
            bytes: vec![0; 4],
            ..thumb("ldr.w", "r3, [pc, #0x4]")
        };
        assert_eq!(relocated(literal).await.text(), "ldr r3, =0x12345678");
        assert_eq!(relocated(thumb("blx", "r3")).await.text(), "blx r3");
    }
}
