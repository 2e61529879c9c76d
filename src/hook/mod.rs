//! Live hooks in flash-resident Thumb code.
//!
//! A hook never writes flash. Two words of overlay RAM are mapped over the
//! hooked instruction, holding a copy of the original bytes with that one
//! instruction replaced by `bkpt`. The prefetch abort vector is pointed at a
//! generated ISR, which lays the interrupted registers out as a flat array,
//! calls the compiled handler on it, runs the displaced instruction and
//! returns behind it.
//!
//! Everything is built while the window is parked at a scratch address; the
//! final overlay move is what makes the hook live. There is no uninstall. A
//! hook stays until the window is moved elsewhere (for example by
//! [`overlay_disable`](crate::memmap::overlay_disable)) or the chip resets.

pub mod isr;
pub mod relocate;

pub use relocate::{Relocation, check_relocatable};

use tracing::{debug, info};

use crate::code::{self, CodeEnv, Disassembler, Instruction, Mode, Toolchain, disasm};
use crate::config::TargetLayout;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::link::Link;
use crate::memmap;
use crate::memory;

/// Fills the displaced instruction; decodes as `bkpt #0xbe`.
pub const TRAP_BYTE: u8 = 0xbe;
/// The overlay always covers two words around the hook.
pub const PATCH_WORDS: u32 = 2;
const PATCH_SIZE: u32 = 4 * PATCH_WORDS;

#[derive(Debug, Clone)]
pub struct HookOptions {
    /// Where the compiled handler goes. The ISR follows it.
    pub handler_address: u32,
    /// Where the overlay is parked while it is filled.
    pub scratch_address: u32,
    /// Drop the displaced instruction; the handler stands in for it.
    pub replace_one_instruction: bool,
    pub env: CodeEnv,
}

impl HookOptions {
    pub fn new(layout: &TargetLayout) -> Self {
        Self {
            handler_address: layout.pad,
            scratch_address: layout.overlay_scratch,
            replace_one_instruction: false,
            env: CodeEnv::for_layout(layout),
        }
    }
}

impl Default for HookOptions {
    fn default() -> Self {
        Self::new(&TargetLayout::default())
    }
}

/// How far an installation got. Only [`HookState::OverlayActive`] is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookState {
    Uninstalled,
    HandlerCompiled,
    SnapshotTaken,
    SnapshotPatched,
    IsrAssembled,
    VectorArmed,
    OverlayActive,
}

/// A live hook, as installed.
///
/// Dropping this does nothing to the target.
#[derive(Debug, Clone)]
pub struct HookInstallation {
    pub state: HookState,
    pub hook_address: u32,
    pub return_address: u32,
    pub handler_address: u32,
    pub handler_len: usize,
    pub isr_address: u32,
    pub isr_len: usize,
    pub overlay_address: u32,
    /// The two words under the overlay, before and after patching.
    pub original_bytes: Vec<u8>,
    pub patched_bytes: Vec<u8>,
    pub relocation: Relocation,
    pub original: Vec<Instruction>,
    pub patched: Vec<Instruction>,
    /// `original` and `patched` next to each other.
    pub diff: String,
}

struct Progress {
    hook_address: u32,
    state: HookState,
}

impl Progress {
    fn advance(&mut self, state: HookState) {
        debug!(hook = self.hook_address, from = ?self.state, to = ?state, "hook state");
        self.state = state;
    }
}

/// Hook the Thumb instruction at `hook_address` with a C++ `handler` body.
///
/// Registers are visible to the handler as `r0`..`r15`, `ip`, `sp`, `lr`,
/// `pc` and `cpsr`, and changes to them are written back. `pc` reads as the
/// hook address, and execution resumes at `pc` plus the size of the
/// displaced instruction, so a handler redirecting control must subtract
/// that size. Hooked code must not run in FIQ mode.
///
/// Nothing the running firmware can observe changes until the vector is
/// armed; every check that can fail happens before that.
#[tracing::instrument(
    skip(device, toolchain, disassembler, handler, options),
    fields(handler_address = options.handler_address)
)]
pub async fn overlay_hook<L: Link, T: Toolchain, D: Disassembler>(
    device: &mut Device<L>,
    toolchain: &T,
    disassembler: &D,
    hook_address: u32,
    handler: &str,
    options: &HookOptions,
) -> Result<HookInstallation> {
    if hook_address & 1 != 0 {
        return Err(Error::Alignment {
            address: hook_address,
            required: 2,
        });
    }
    let overlay_address = hook_address & !3;
    check_window(overlay_address)?;
    check_window(options.scratch_address)?;
    let previous = memmap::ivt_get(device, disassembler, memmap::BKPT_VECTOR).await?;
    debug!(previous, "prefetch abort handler before hooking");
    let mut progress = Progress {
        hook_address,
        state: HookState::Uninstalled,
    };

    let handler_address = options.handler_address;
    let handler_len = code::compile_and_install(
        device,
        toolchain,
        handler_address,
        &isr::handler_source(handler),
        &options.env,
        Mode::Thumb,
    )
    .await?;
    progress.advance(HookState::HandlerCompiled);

    let window = memmap::overlay_get(device).await?;
    if window.overlaps(overlay_address, PATCH_SIZE) {
        // An earlier hook is shadowing the flash we want to copy.
        memmap::overlay_set(device, options.scratch_address, PATCH_WORDS).await?;
    }
    let original_bytes = memory::read_block(device, overlay_address, PATCH_SIZE).await?;
    progress.advance(HookState::SnapshotTaken);

    let offset = (hook_address - overlay_address) as usize;
    let original =
        disassembler.disassemble(&original_bytes[offset..], hook_address, Mode::Thumb)?;
    let Some(displaced) = original.first().filter(|l| l.address == hook_address) else {
        return Err(Error::Disassembly(format!(
            "can't decode the instruction at {hook_address:#010x}"
        )));
    };
    let return_address = displaced.end();
    if return_address > overlay_address + PATCH_SIZE {
        return Err(Error::UnsupportedRelocation {
            address: hook_address,
            instruction: displaced.text(),
            reason: "instruction runs past the patch window",
        });
    }
    let relocation =
        relocate::relocate(device, displaced, options.replace_one_instruction).await?;

    let mut patched_bytes = original_bytes.clone();
    patched_bytes[offset..(return_address - overlay_address) as usize].fill(TRAP_BYTE);
    progress.advance(HookState::SnapshotPatched);

    let isr_address = (handler_address + handler_len as u32 + 0x1f) & !0x1f;
    let mut env = options.env.clone();
    env.define("handler_address", handler_address)
        .define("hook_instruction_size", return_address - hook_address);
    let assembled = code::assemble_and_install(
        device,
        toolchain,
        isr_address,
        &isr::isr_source(relocation.text()),
        &env,
        Mode::Arm,
    )
    .await;
    let isr_len = match assembled {
        Ok(len) => len,
        // The rest of the ISR is fixed text; only the relocated line varies.
        Err(Error::Compile(e)) if !matches!(relocation, Relocation::Omitted) => {
            debug!("ISR assembly failed:\n{}", e.output);
            return Err(Error::UnsupportedRelocation {
                address: hook_address,
                instruction: displaced.text(),
                reason: "no ARM-state equivalent",
            });
        }
        Err(e) => return Err(e),
    };
    progress.advance(HookState::IsrAssembled);

    memmap::overlay_set(device, options.scratch_address, PATCH_WORDS).await?;
    memory::poke_words(
        device,
        options.scratch_address,
        &memory::words_from_bytes(&patched_bytes, memory::PAD_BYTE),
        None,
    )
    .await?;
    memmap::ivt_set(device, disassembler, memmap::BKPT_VECTOR, isr_address).await?;
    progress.advance(HookState::VectorArmed);

    memmap::overlay_set(device, overlay_address, PATCH_WORDS).await?;
    progress.advance(HookState::OverlayActive);

    let patched = verify(device, disassembler, hook_address).await?;
    let diff = disasm::side_by_side(&original, &patched);
    info!(
        hook_address,
        return_address, handler_address, handler_len, isr_address, isr_len, "hook installed"
    );
    debug!("\n{diff}");

    Ok(HookInstallation {
        state: progress.state,
        hook_address,
        return_address,
        handler_address,
        handler_len,
        isr_address,
        isr_len,
        overlay_address,
        original_bytes,
        patched_bytes,
        relocation,
        original,
        patched,
        diff,
    })
}

/// The two-word window at `address` must fit the mappable range.
fn check_window(address: u32) -> Result<()> {
    if address & 3 != 0 {
        return Err(Error::Alignment {
            address,
            required: 4,
        });
    }
    match address.checked_add(PATCH_SIZE) {
        Some(end) if end <= memmap::OVERLAY_MAPPABLE_END => Ok(()),
        _ => Err(Error::OverlayRange {
            address,
            wordcount: PATCH_WORDS,
        }),
    }
}

/// Disassemble the live code around the hook and look for the trap.
async fn verify<L: Link, D: Disassembler>(
    device: &mut Device<L>,
    disassembler: &D,
    hook_address: u32,
) -> Result<Vec<Instruction>> {
    let context =
        disasm::disassemble_context(device, disassembler, hook_address, PATCH_SIZE, Mode::Thumb);
    let lines = match context.await {
        Ok(lines) => lines,
        Err(Error::Disassembly(disassembly)) => {
            return Err(Error::HookVerification {
                address: hook_address,
                disassembly,
            });
        }
        Err(e) => return Err(e),
    };
    let trapped = lines
        .iter()
        .any(|l| l.address == hook_address && l.base_mnemonic() == "bkpt");
    if !trapped {
        return Err(Error::HookVerification {
            address: hook_address,
            disassembly: disasm::listing(&lines),
        });
    }
    Ok(lines)
}
