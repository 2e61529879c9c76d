//! The host-side cross compiler, seen through the narrow interface the
//! loader needs: source in, position-dependent machine code out.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::process::Output;

use tokio::process::Command;
use tracing::{debug, trace};

use super::disasm::Mode;
use crate::config::TargetLayout;
use crate::error::{Error, Result};

/// Names gas would read as registers; never turned into `.equ` symbols.
const REGISTER_NAMES: [&str; 4] = ["ip", "sp", "lr", "pc"];

/// Named snippets and integer constants shared by every compile.
///
/// Order is preserved: includes are emitted in insertion order, and a define
/// can be overwritten in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeEnv {
    pub includes: Vec<(String, String)>,
    pub defines: Vec<(String, u32)>,
}

impl CodeEnv {
    /// An environment that knows where the scratch pad is.
    pub fn for_layout(layout: &TargetLayout) -> Self {
        let mut env = Self::default();
        env.define("pad", layout.pad);
        env
    }

    pub fn define(&mut self, name: &str, value: u32) -> &mut Self {
        match self.defines.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.defines.push((name.to_string(), value)),
        }
        self
    }

    pub fn include(&mut self, name: &str, text: &str) -> &mut Self {
        match self.includes.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = text.to_string(),
            None => self.includes.push((name.to_string(), text.to_string())),
        }
        self
    }

    fn cpp_prologue(&self) -> String {
        let mut out = String::from("#include <stdint.h>\n");
        for (name, value) in &self.defines {
            out.push_str(&format!("const uint32_t {name} = 0x{value:08x};\n"));
        }
        for (_, text) in &self.includes {
            out.push_str(text);
            out.push('\n');
        }
        out
    }

    fn asm_defines(&self) -> String {
        self.defines
            .iter()
            .filter(|(name, _)| !is_register_name(name))
            .map(|(name, value)| format!("\t.equ {name}, 0x{value:08x}\n"))
            .collect()
    }
}

fn is_register_name(name: &str) -> bool {
    REGISTER_NAMES.contains(&name)
        || name
            .strip_prefix('r')
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// Whether a compiled expression produces a value in r0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionKind {
    Value,
    Statement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledExpression {
    pub code: Vec<u8>,
    pub kind: ExpressionKind,
}

/// Several named functions compiled into one image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Library {
    pub code: Vec<u8>,
    /// Absolute entry points, Thumb bit set for Thumb code.
    pub symbols: BTreeMap<String, u32>,
}

pub trait Toolchain {
    /// Compile a C++ expression into `unsigned start(unsigned arg)`, linked
    /// to run at `address`. The entry point is the first byte of the output.
    fn compile(
        &self,
        address: u32,
        expression: &str,
        env: &CodeEnv,
        mode: Mode,
    ) -> impl Future<Output = Result<Vec<u8>>>;

    /// Compile `(name, expression)` pairs into one image of named functions.
    fn compile_library(
        &self,
        address: u32,
        functions: &[(String, String)],
        env: &CodeEnv,
        mode: Mode,
    ) -> impl Future<Output = Result<Library>>;

    fn assemble(
        &self,
        address: u32,
        source: &str,
        env: &CodeEnv,
        mode: Mode,
    ) -> impl Future<Output = Result<Vec<u8>>>;

    /// Compile `expression` as an integer if it is one, otherwise as a
    /// statement block that returns nothing useful.
    fn compile_expression(
        &self,
        address: u32,
        expression: &str,
        env: &CodeEnv,
        mode: Mode,
    ) -> impl Future<Output = Result<CompiledExpression>> {
        async move {
            let value = format!("(uint32_t)({expression})");
            match self.compile(address, &value, env, mode).await {
                Ok(code) => Ok(CompiledExpression {
                    code,
                    kind: ExpressionKind::Value,
                }),
                Err(Error::Compile(e)) => {
                    trace!("not an integer expression:\n{}", e.output);
                    let statement = format!("{{ {expression}; 0; }}");
                    let code = self.compile(address, &statement, env, mode).await?;
                    Ok(CompiledExpression {
                        code,
                        kind: ExpressionKind::Statement,
                    })
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Compiler output plus every text file that went into the failed build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeError {
    pub output: String,
    pub files: Vec<(String, String)>,
    flagged: BTreeSet<(String, usize)>,
}

impl CodeError {
    pub fn new(output: &str, files: Vec<(String, String)>) -> Self {
        let output = output.trim_end().to_string();
        let mut flagged = BTreeSet::new();
        for (name, _) in &files {
            let needle = format!("{name}:");
            for (at, _) in output.match_indices(&needle) {
                let rest = &output[at + needle.len()..];
                let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
                if !rest[digits.len()..].starts_with(':') {
                    continue;
                }
                if let Ok(line) = digits.parse() {
                    flagged.insert((name.clone(), line));
                }
            }
        }
        Self {
            output,
            files,
            flagged,
        }
    }

    pub fn is_flagged(&self, file: &str, line: usize) -> bool {
        self.flagged.contains(&(file.to_string(), line))
    }

    /// Numbered listing of every file, with diagnosed lines fenced in
    /// `>>>` / `<<<`.
    pub fn listing(&self) -> String {
        const WIDTH: usize = 79;
        const MARGIN: usize = 10;
        let mut out = Vec::new();
        for (name, content) in &self.files {
            let header = format!("{} {name} ", "=".repeat(MARGIN));
            let fill = WIDTH.saturating_sub(header.chars().count());
            out.push(format!("{header}{}", "=".repeat(fill)));
            for (i, line) in content.trim_end().lines().enumerate() {
                let number = i + 1;
                let mut text = format!("{number:6}  {}", line.trim_end());
                if self.is_flagged(name, number) {
                    let s = (text.len() - text.trim_start().len()).saturating_sub(1);
                    text.replace_range(..s, &">".repeat(s));
                    let pad = WIDTH.saturating_sub(s + text.len());
                    text.push_str(&" ".repeat(pad));
                    text.push_str(&"<".repeat(s));
                }
                out.push(text);
            }
            out.push(String::new());
        }
        out.join("\n")
    }
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code compilation errors\n\n{}\n{}", self.listing(), self.output)
    }
}

impl std::error::Error for CodeError {}

/// `arm-none-eabi-gcc` and friends, run in a throwaway directory.
#[derive(Debug, Clone)]
pub struct GccToolchain {
    pub cc: String,
    pub objcopy: String,
    pub objdump: String,
    /// `-I` paths for includes that reference headers on disk.
    pub include_dirs: Vec<String>,
}

impl Default for GccToolchain {
    fn default() -> Self {
        Self {
            cc: "arm-none-eabi-gcc".into(),
            objcopy: "arm-none-eabi-objcopy".into(),
            objdump: "arm-none-eabi-objdump".into(),
            include_dirs: Vec::new(),
        }
    }
}

const CPP_FILE: &str = "patch.cpp";
const ASM_FILE: &str = "patch.s";
const LD_FILE: &str = "patch.ld";
const OBJ_FILE: &str = "patch.o";
const BIN_FILE: &str = "patch.bin";

fn check_word_aligned(address: u32) -> Result<()> {
    if address & 3 != 0 {
        return Err(Error::Alignment {
            address,
            required: 4,
        });
    }
    Ok(())
}

fn linker_script(address: u32, sections: &str) -> String {
    format!(
        "MEMORY {{ PATCH (rwx) : ORIGIN = 0x{address:08x}, LENGTH = 2M }}\n\
         SECTIONS {{ .text : {{ {sections} }} > PATCH }}\n"
    )
}

fn thumb_flag(mode: Mode) -> &'static str {
    match mode {
        Mode::Thumb => "-mthumb",
        Mode::Arm => "-mno-thumb",
    }
}

async fn run(dir: &Path, program: &str, args: &[&str]) -> Result<Output> {
    trace!(program, ?args, "running");
    Ok(Command::new(program).args(args).current_dir(dir).output().await?)
}

/// Text files in `dir` worth showing next to a diagnostic.
async fn collect_text(dir: &Path) -> Vec<(String, String)> {
    let mut files = Vec::new();
    for name in [CPP_FILE, ASM_FILE, LD_FILE] {
        if let Ok(text) = tokio::fs::read_to_string(dir.join(name)).await {
            files.push((name.to_string(), text));
        }
    }
    files
}

impl GccToolchain {
    async fn build(&self, dir: &Path, source: &str, mode: Mode) -> Result<()> {
        let include_args: Vec<String> =
            self.include_dirs.iter().map(|d| format!("-I{d}")).collect();
        let mut args = vec!["-o", OBJ_FILE, source, "-T", LD_FILE, "-nostdlib"];
        if source == CPP_FILE {
            // No exceptions, smallest possible code, libgcc for division.
            args.extend([
                "-Os",
                "-fwhole-program",
                "-fpermissive",
                "-Wno-multichar",
                "-fno-exceptions",
                "-std=gnu++11",
                "-lgcc",
            ]);
        } else {
            args.push("-nostdinc");
        }
        args.push(thumb_flag(mode));
        args.extend(include_args.iter().map(String::as_str));

        let out = run(dir, &self.cc, &args).await?;
        if !out.status.success() {
            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&out.stderr));
            return Err(CodeError::new(&text, collect_text(dir).await).into());
        }
        Ok(())
    }

    async fn objcopy(&self, dir: &Path) -> Result<Vec<u8>> {
        let out = run(dir, &self.objcopy, &[OBJ_FILE, "-O", "binary", BIN_FILE]).await?;
        if !out.status.success() {
            return Err(CodeError::new(&String::from_utf8_lossy(&out.stderr), Vec::new()).into());
        }
        Ok(tokio::fs::read(dir.join(BIN_FILE)).await?)
    }

    async fn write_cpp(&self, dir: &Path, address: u32, env: &CodeEnv, body: &str) -> Result<()> {
        check_word_aligned(address)?;
        tokio::fs::write(
            dir.join(LD_FILE),
            linker_script(address, "*(.first) *(.text) *(.rodata) *(.bss)"),
        )
        .await?;
        tokio::fs::write(dir.join(CPP_FILE), format!("{}{body}\n", env.cpp_prologue())).await?;
        Ok(())
    }
}

impl Toolchain for GccToolchain {
    async fn compile(
        &self,
        address: u32,
        expression: &str,
        env: &CodeEnv,
        mode: Mode,
    ) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let body = format!(
            "extern \"C\"\n\
             unsigned __attribute__ ((externally_visible, section(\".first\")))\n\
             start(unsigned arg)\n\
             {{\n\
             return ( {expression} );\n\
             }}"
        );
        self.write_cpp(dir.path(), address, env, &body).await?;
        self.build(dir.path(), CPP_FILE, mode).await?;
        let code = self.objcopy(dir.path()).await?;
        debug!(address, len = code.len(), "compiled");
        Ok(code)
    }

    async fn compile_library(
        &self,
        address: u32,
        functions: &[(String, String)],
        env: &CodeEnv,
        mode: Mode,
    ) -> Result<Library> {
        let dir = tempfile::tempdir()?;
        let body: Vec<String> = functions
            .iter()
            .map(|(name, expression)| {
                format!(
                    "extern \"C\"\n\
                     unsigned __attribute__ ((externally_visible))\n\
                     {name}(unsigned arg)\n\
                     {{\n\
                     return ( {expression} );\n\
                     }}\n"
                )
            })
            .collect();
        self.write_cpp(dir.path(), address, env, &body.join("\n")).await?;
        self.build(dir.path(), CPP_FILE, mode).await?;

        let out = run(dir.path(), &self.objdump, &["-t", "-w", OBJ_FILE]).await?;
        let thumb_bit = (mode == Mode::Thumb) as u32;
        let symbols = parse_function_symbols(&String::from_utf8_lossy(&out.stdout), thumb_bit);
        let code = self.objcopy(dir.path()).await?;
        Ok(Library { code, symbols })
    }

    async fn assemble(
        &self,
        address: u32,
        source: &str,
        env: &CodeEnv,
        mode: Mode,
    ) -> Result<Vec<u8>> {
        check_word_aligned(address)?;
        let dir = tempfile::tempdir()?;
        let set_mode = match mode {
            Mode::Thumb => ".thumb",
            Mode::Arm => ".arm",
        };
        tokio::fs::write(dir.path().join(LD_FILE), linker_script(address, "*(.text)")).await?;
        tokio::fs::write(
            dir.path().join(ASM_FILE),
            format!(
                ".text\n.syntax unified\n.global _start\n{set_mode}\n{}_start:\n{source}\n",
                env.asm_defines()
            ),
        )
        .await?;
        self.build(dir.path(), ASM_FILE, mode).await?;
        let code = self.objcopy(dir.path()).await?;
        debug!(address, len = code.len(), "assembled");
        Ok(code)
    }
}

/// Function symbols in `.text` from `objdump -t -w` output.
fn parse_function_symbols(table: &str, thumb_bit: u32) -> BTreeMap<String, u32> {
    table
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            // 01e00000 g     F .text  0000000c name
            match tokens.as_slice() {
                [value, _, "F", ".text", _, name, ..] => {
                    let value = u32::from_str_radix(value, 16).ok()?;
                    Some((name.to_string(), value | thumb_bit))
                }
                _ => None,
            }
        })
        .collect()
}
