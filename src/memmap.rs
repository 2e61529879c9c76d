//! The movable RAM overlay window and the exception vector table.
//!
//! Both are single global resources on the chip. Nothing here coordinates
//! between callers: whoever programs the window last owns it.

use tracing::debug;

use crate::code::{Disassembler, Mode, disasm};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::link::Link;

pub const OVERLAY_CONTROL: u32 = 0x0401_1f04;
pub const OVERLAY_BASE: u32 = OVERLAY_CONTROL + 0xc;
/// Inclusive: the address of the last mapped byte.
pub const OVERLAY_LIMIT: u32 = OVERLAY_CONTROL + 0x10;
pub const OVERLAY_ENABLE_A: u32 = 0x200;
pub const OVERLAY_ENABLE_B: u32 = 0x2000;

/// Size of the RAM behind the window.
pub const OVERLAY_MAX_WORDS: u32 = 1024;
/// The window can only be placed in the low 8 MB.
pub const OVERLAY_MAPPABLE_END: u32 = 0x80_0000;

/// Prefetch abort, which is where `bkpt` lands.
pub const BKPT_VECTOR: u32 = 0x0c;

/// Current placement of the overlay window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayWindow {
    pub address: u32,
    pub wordcount: u32,
    pub enabled: bool,
}

impl OverlayWindow {
    /// Whether the mapped window intersects `[address, address + size)`.
    pub fn overlaps(&self, address: u32, size: u32) -> bool {
        let start = self.address as u64;
        let end = start + 4 * self.wordcount as u64;
        self.enabled && start < address as u64 + size as u64 && (address as u64) < end
    }
}

/// `*address |= bits`. Two round trips, not atomic on the target.
pub async fn poke_orr<L: Link>(device: &mut Device<L>, address: u32, bits: u32) -> Result<()> {
    let word = device.peek(address).await?;
    device.poke(address, word | bits).await
}

/// `*address &= !bits`. Two round trips, not atomic on the target.
pub async fn poke_bic<L: Link>(device: &mut Device<L>, address: u32, bits: u32) -> Result<()> {
    let word = device.peek(address).await?;
    device.poke(address, word & !bits).await
}

/// Map `wordcount` words of overlay RAM at `address`.
///
/// The window is switched off while the base and limit move, so flash is
/// never shadowed by a half-programmed mapping.
pub async fn overlay_set<L: Link>(
    device: &mut Device<L>,
    address: u32,
    wordcount: u32,
) -> Result<()> {
    if address & 3 != 0 {
        return Err(Error::Alignment {
            address,
            required: 4,
        });
    }
    let end = address as u64 + 4 * wordcount as u64;
    if wordcount == 0 || wordcount > OVERLAY_MAX_WORDS || end > OVERLAY_MAPPABLE_END as u64 {
        return Err(Error::OverlayRange { address, wordcount });
    }
    debug!(address, wordcount, "overlay set");
    poke_bic(device, OVERLAY_CONTROL, OVERLAY_ENABLE_A).await?;
    poke_bic(device, OVERLAY_CONTROL, OVERLAY_ENABLE_B).await?;
    device.poke(OVERLAY_BASE, address).await?;
    device.poke(OVERLAY_LIMIT, address + 4 * wordcount - 1).await?;
    poke_orr(device, OVERLAY_CONTROL, OVERLAY_ENABLE_A).await?;
    poke_orr(device, OVERLAY_CONTROL, OVERLAY_ENABLE_B).await
}

/// Unmap the window and park it on an empty range.
pub async fn overlay_disable<L: Link>(device: &mut Device<L>) -> Result<()> {
    debug!("overlay disable");
    poke_bic(device, OVERLAY_CONTROL, OVERLAY_ENABLE_A).await?;
    poke_bic(device, OVERLAY_CONTROL, OVERLAY_ENABLE_B).await?;
    device.poke(OVERLAY_BASE, 0xffff_ffff).await?;
    device.poke(OVERLAY_LIMIT, 0).await
}

pub async fn overlay_get<L: Link>(device: &mut Device<L>) -> Result<OverlayWindow> {
    let control = device.peek(OVERLAY_CONTROL).await?;
    let address = device.peek(OVERLAY_BASE).await?;
    let limit = device.peek(OVERLAY_LIMIT).await?;
    let both = OVERLAY_ENABLE_A | OVERLAY_ENABLE_B;
    // A parked window has limit < base.
    let wordcount = match limit.checked_sub(address) {
        Some(span) => span / 4 + 1,
        None => 0,
    };
    Ok(OverlayWindow {
        address,
        wordcount,
        enabled: control & both == both,
    })
}

/// Where the `ldr pc, [pc, #n]` shim in vector slot `vector` keeps its target.
///
/// `None` when the slot holds anything other than that shim.
pub async fn ivt_find_target<L: Link>(
    device: &mut Device<L>,
    disassembler: &impl Disassembler,
    vector: u32,
) -> Result<Option<u32>> {
    let line = vector_instruction(device, disassembler, vector).await?;
    Ok(line.as_ref().and_then(shim_literal))
}

/// The handler a vector currently jumps to.
pub async fn ivt_get<L: Link>(
    device: &mut Device<L>,
    disassembler: &impl Disassembler,
    vector: u32,
) -> Result<u32> {
    let literal = resolve_vector(device, disassembler, vector).await?;
    device.peek(literal).await
}

/// Point vector `vector` at `handler`. Only works while the table sits in RAM.
pub async fn ivt_set<L: Link>(
    device: &mut Device<L>,
    disassembler: &impl Disassembler,
    vector: u32,
    handler: u32,
) -> Result<()> {
    let literal = resolve_vector(device, disassembler, vector).await?;
    debug!(vector, literal, handler, "ivt set");
    device.poke(literal, handler).await
}

async fn resolve_vector<L: Link>(
    device: &mut Device<L>,
    disassembler: &impl Disassembler,
    vector: u32,
) -> Result<u32> {
    let line = vector_instruction(device, disassembler, vector).await?;
    match line.as_ref().and_then(shim_literal) {
        Some(literal) => Ok(literal),
        None => Err(Error::VectorNotIndirect {
            address: vector,
            instruction: line.map(|l| l.text()).unwrap_or_else(|| "<undecodable>".into()),
        }),
    }
}

async fn vector_instruction<L: Link>(
    device: &mut Device<L>,
    disassembler: &impl Disassembler,
    vector: u32,
) -> Result<Option<disasm::Instruction>> {
    let word = device.peek(vector).await?;
    let lines = disassembler.disassemble(&word.to_le_bytes(), vector, Mode::Arm)?;
    Ok(lines.into_iter().next())
}

fn shim_literal(line: &disasm::Instruction) -> Option<u32> {
    if !line.operands.starts_with("pc, ") {
        return None;
    }
    disasm::ldrpc_source_address(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::sim::SimulatedTarget;
    use crate::testing::ScriptedDisassembler;

    async fn device(target: SimulatedTarget) -> Device<SimulatedTarget> {
        Device::open(target, TransportConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn overlay_set_writes_registers_in_order() {
        let mut target = SimulatedTarget::new();
        target
            .memory_mut()
            .load(OVERLAY_CONTROL, &(OVERLAY_ENABLE_A | OVERLAY_ENABLE_B | 1).to_le_bytes());
        let mut device = device(target).await;

        overlay_set(&mut device, 0x1000, 2).await.unwrap();

        let writes = device.link().memory().writes().to_vec();
        assert_eq!(
            writes,
            vec![
                (OVERLAY_CONTROL, OVERLAY_ENABLE_B | 1),
                (OVERLAY_CONTROL, 1),
                (OVERLAY_BASE, 0x1000),
                (OVERLAY_LIMIT, 0x1007),
                (OVERLAY_CONTROL, OVERLAY_ENABLE_A | 1),
                (OVERLAY_CONTROL, OVERLAY_ENABLE_A | OVERLAY_ENABLE_B | 1),
            ]
        );
        let window = overlay_get(&mut device).await.unwrap();
        assert_eq!(
            window,
            OverlayWindow {
                address: 0x1000,
                wordcount: 2,
                enabled: true
            }
        );
        assert!(window.overlaps(0x1004, 4));
        assert!(!window.overlaps(0x1008, 8));
    }

    #[tokio::test]
    async fn overlay_set_checks_its_arguments() {
        let mut device = device(SimulatedTarget::new()).await;
        assert!(matches!(
            overlay_set(&mut device, 0x1002, 2).await,
            Err(Error::Alignment { .. })
        ));
        assert!(matches!(
            overlay_set(&mut device, 0x7f_fffc, 2).await,
            Err(Error::OverlayRange { .. })
        ));
        assert!(matches!(
            overlay_set(&mut device, 0, OVERLAY_MAX_WORDS + 1).await,
            Err(Error::OverlayRange { .. })
        ));
        assert!(device.link().memory().writes().is_empty());
    }

    #[tokio::test]
    async fn disabled_overlay_reads_back_empty() {
        let mut device = device(SimulatedTarget::new()).await;
        overlay_set(&mut device, 0x2000, 4).await.unwrap();
        overlay_disable(&mut device).await.unwrap();
        let window = overlay_get(&mut device).await.unwrap();
        assert!(!window.enabled);
        assert_eq!(window.address, 0xffff_ffff);
        assert_eq!(window.wordcount, 0);
        assert!(!window.overlaps(0, u32::MAX));
    }

    #[tokio::test]
    async fn vectors_resolve_through_their_literal() {
        let mut target = SimulatedTarget::new();
        // ldr pc, [pc, #0x18] at the prefetch abort slot
        target.memory_mut().load(BKPT_VECTOR, &0xe59f_f018u32.to_le_bytes());
        target.memory_mut().load(0x2c, &0x0000_4321u32.to_le_bytes());
        target.memory_mut().load(0x10, &0xe1a0_0000u32.to_le_bytes());
        let mut device = device(target).await;
        let dis = ScriptedDisassembler;

        assert_eq!(ivt_find_target(&mut device, &dis, BKPT_VECTOR).await.unwrap(), Some(0x2c));
        assert_eq!(ivt_get(&mut device, &dis, BKPT_VECTOR).await.unwrap(), 0x4321);
        ivt_set(&mut device, &dis, BKPT_VECTOR, 0x1e0_0040).await.unwrap();
        assert_eq!(device.link().read_word(0x2c), 0x1e0_0040);

        assert_eq!(ivt_find_target(&mut device, &dis, 0x10).await.unwrap(), None);
        let err = ivt_set(&mut device, &dis, 0x10, 0).await.unwrap_err();
        assert!(matches!(err, Error::VectorNotIndirect { address: 0x10, .. }));
    }
}
