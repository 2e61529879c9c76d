//! Getting code onto the target and running it.
//!
//! Compilation itself is delegated to a [`Toolchain`]; this module only moves
//! the resulting bytes into target RAM and calls them through `blx`.

pub mod disasm;
pub mod toolchain;

pub use disasm::{CapstoneDisassembler, Disassembler, Instruction, Mode};
pub use toolchain::{
    CodeEnv, CodeError, CompiledExpression, ExpressionKind, GccToolchain, Library, Toolchain,
};

use std::collections::BTreeMap;

use tracing::debug;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::link::Link;
use crate::memory;

/// Write machine code at a word-aligned `address`. Returns its length in bytes.
///
/// A partial last word is padded with [`memory::PAD_BYTE`].
pub async fn install<L: Link>(device: &mut Device<L>, address: u32, code: &[u8]) -> Result<usize> {
    if address & 3 != 0 {
        return Err(Error::Alignment {
            address,
            required: 4,
        });
    }
    memory::poke_words_from_bytes(device, address, code).await?;
    Ok(code.len())
}

/// Install a library image and return its symbol table.
pub async fn install_library<L: Link>(
    device: &mut Device<L>,
    address: u32,
    library: &Library,
) -> Result<BTreeMap<String, u32>> {
    install(device, address, &library.code).await?;
    Ok(library.symbols.clone())
}

pub async fn compile_and_install<L: Link, T: Toolchain>(
    device: &mut Device<L>,
    toolchain: &T,
    address: u32,
    expression: &str,
    env: &CodeEnv,
    mode: Mode,
) -> Result<usize> {
    let code = toolchain.compile(address, expression, env, mode).await?;
    install(device, address, &code).await
}

pub async fn compile_library_and_install<L: Link, T: Toolchain>(
    device: &mut Device<L>,
    toolchain: &T,
    address: u32,
    functions: &[(String, String)],
    env: &CodeEnv,
    mode: Mode,
) -> Result<BTreeMap<String, u32>> {
    let library = toolchain.compile_library(address, functions, env, mode).await?;
    install_library(device, address, &library).await
}

pub async fn assemble_and_install<L: Link, T: Toolchain>(
    device: &mut Device<L>,
    toolchain: &T,
    address: u32,
    source: &str,
    env: &CodeEnv,
    mode: Mode,
) -> Result<usize> {
    let code = toolchain.assemble(address, source, env, mode).await?;
    install(device, address, &code).await
}

/// Compile and run a C++ expression as Thumb code at `address`.
///
/// Integer expressions return `Some(r0)`; statements return `None`.
pub async fn evalc<L: Link, T: Toolchain>(
    device: &mut Device<L>,
    toolchain: &T,
    env: &CodeEnv,
    address: u32,
    expression: &str,
    arg: u32,
) -> Result<Option<u32>> {
    let compiled = toolchain
        .compile_expression(address, expression, env, Mode::Thumb)
        .await?;
    let len = install(device, address, &compiled.code).await?;
    debug!(address, len, kind = ?compiled.kind, "evalc");
    let (r0, _) = device.blx(address | 1, arg).await?;
    Ok(match compiled.kind {
        ExpressionKind::Value => Some(r0),
        ExpressionKind::Statement => None,
    })
}

/// Assemble and run a snippet, preserving r2-r12 and lr around it.
///
/// The wrapper is always ARM code; with `thumb` the snippet itself is
/// assembled as Thumb and reached through an interworking branch.
pub async fn evalasm<L: Link, T: Toolchain>(
    device: &mut Device<L>,
    toolchain: &T,
    env: &CodeEnv,
    address: u32,
    source: &str,
    r0: u32,
    thumb: bool,
) -> Result<(u32, u32)> {
    let wrapped = if thumb {
        format!(
            "\tpush\t{{r2-r12, lr}}\n\
             \tadr\tlr, link\n\
             \tadr\tr8, text+1\n\
             \tbx\tr8\n\
             link:\n\
             \tpop\t{{r2-r12, pc}}\n\
             \t.pool\n\
             \t.thumb\n\
             \t.align\t5\n\
             text:\n\
             {source}\n\
             \tbx\tlr\n"
        )
    } else {
        format!("\tpush\t{{r2-r12, lr}}\n{source}\n\tpop\t{{r2-r12, pc}}\n")
    };
    assemble_and_install(device, toolchain, address, &wrapped, env, Mode::Arm).await?;
    device.blx(address, r0).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::sim::SimulatedTarget;
    use crate::testing::{CallKind, RecordingToolchain};

    async fn device() -> Device<SimulatedTarget> {
        Device::open(SimulatedTarget::new(), TransportConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn install_pads_the_last_word() {
        let mut device = device().await;
        let len = install(&mut device, 0x1e00000, &[1, 2, 3, 4, 5, 6]).await.unwrap();
        assert_eq!(len, 6);
        assert_eq!(device.link().read_word(0x1e00000), 0x04030201);
        assert_eq!(device.link().read_word(0x1e00004), 0xffff0605);
    }

    #[tokio::test]
    async fn install_rejects_unaligned_addresses() {
        let mut device = device().await;
        let err = install(&mut device, 0x1e00002, &[0; 4]).await.unwrap_err();
        assert!(matches!(err, Error::Alignment { address: 0x1e00002, .. }));
        assert!(device.link().memory().writes().is_empty());
    }

    #[tokio::test]
    async fn libraries_load_with_their_symbol_table() {
        let mut device = device().await;
        let toolchain = RecordingToolchain::new();
        let functions = vec![
            ("square".to_string(), "arg * arg".to_string()),
            ("twice".to_string(), "arg + arg".to_string()),
        ];

        let symbols = compile_library_and_install(
            &mut device,
            &toolchain,
            0x1e10000,
            &functions,
            &CodeEnv::default(),
            Mode::Thumb,
        )
        .await
        .unwrap();

        assert_eq!(symbols["square"], 0x1e10001);
        assert_eq!(symbols["twice"], 0x1e10005);
        for offset in (0..12).step_by(4) {
            assert_eq!(device.link().read_word(0x1e10000 + offset), 0xa5a5_a5a5);
        }
        let calls = toolchain.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!((calls[0].kind, calls[0].address), (CallKind::Library, 0x1e10000));
        assert!(calls[0].source.contains("square: arg * arg"));
    }

    #[tokio::test]
    async fn misaligned_library_is_not_written() {
        let mut device = device().await;
        let library = Library {
            code: vec![0; 8],
            symbols: BTreeMap::from([("f".to_string(), 0x1e10003)]),
        };
        let err = install_library(&mut device, 0x1e10002, &library).await.unwrap_err();
        assert!(matches!(err, Error::Alignment { .. }));
        assert!(device.link().memory().writes().is_empty());
    }

    #[tokio::test]
    async fn evalc_calls_thumb_entry_and_keeps_r0_for_values() {
        let mut target = SimulatedTarget::new();
        target.add_gadget(0x1e00001, |_, arg| (arg + 5, 0));
        let mut device = Device::open(target, TransportConfig::default()).await.unwrap();
        let toolchain = RecordingToolchain::new();
        let env = CodeEnv::default();

        let value = evalc(&mut device, &toolchain, &env, 0x1e00000, "arg + 5", 10).await.unwrap();
        assert_eq!(value, Some(15));

        let toolchain = RecordingToolchain::new().rejecting_values();
        let value = evalc(&mut device, &toolchain, &env, 0x1e00000, "x = 1", 10).await.unwrap();
        assert_eq!(value, None);
        let calls = toolchain.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].source, "(uint32_t)(x = 1)");
        assert_eq!(calls[1].source, "{ x = 1; 0; }");
    }

    #[tokio::test]
    async fn evalasm_wraps_in_arm_prologue() {
        let mut device = device().await;
        let toolchain = RecordingToolchain::new();
        let env = CodeEnv::default();
        let (r0, _) = evalasm(&mut device, &toolchain, &env, 0x1e40000, "add r0, #1", 7, true)
            .await
            .unwrap();
        // no gadget registered, the simulator echoes r0
        assert_eq!(r0, 7);
        let calls = toolchain.calls();
        assert_eq!(calls[0].kind, CallKind::Assemble);
        assert_eq!(calls[0].mode, Mode::Arm);
        assert!(calls[0].source.contains(".thumb"));
        assert!(calls[0].source.contains("add r0, #1"));
    }
}
