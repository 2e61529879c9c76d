//! Source text for the two pieces of code a hook loads into RAM.

use std::fmt::Write;

/// C++ statement expression around a handler body.
///
/// `arg` points at `regs[0]`; `regs[-1]` is the interrupted cpsr. Every
/// register is a named reference into that array, so assignments stick.
pub fn handler_source(body: &str) -> String {
    let mut aliases = String::new();
    for i in 0..16 {
        let _ = writeln!(aliases, "    uint32_t& r{i} = regs[{i}];");
    }
    format!(
        "{{\n\
         \x20   uint32_t* regs = (uint32_t*) arg;\n\
         {aliases}\
         \x20   uint32_t& ip = r12;\n\
         \x20   uint32_t& sp = r13;\n\
         \x20   uint32_t& lr = r14;\n\
         \x20   uint32_t& pc = r15;\n\
         \x20   uint32_t& cpsr = regs[-1];\n\
         \x20   {{ {body}; }}\n\
         \x20   0;\n\
         }}"
    )
}

/// ARM-state prefetch abort handler that bridges into the compiled handler.
///
/// Needs `handler_address` (Thumb entry, bit 0 clear) and
/// `hook_instruction_size` defined as assembler symbols.
///
/// Stack while the handler runs, lowest address first:
///
/// ```text
/// sp+0      abort-mode cpsr
/// sp+4      regs[-1]   interrupted cpsr (spsr)
/// sp+8      regs[0..16]
/// sp+72     r0-r12, lr  exception return frame
/// ```
///
/// The relocated instruction runs in the interrupted mode on the handler's
/// view of r0-r14 and the flags. Code interrupted in FIQ mode is not
/// supported: r8-r12 are banked there and the ISR reads the wrong bank.
pub fn isr_source(relocated: &str) -> String {
    format!(
        r#"
    push    {{r0-r12, lr}}          @ return frame
    push    {{r0-r2}}               @ room for regs[13..16]
    push    {{r0-r12}}              @ regs[0..13]
    mrs     r11, spsr
    mrs     r10, cpsr
    push    {{r10-r11}}             @ abort cpsr, regs[-1]

    @ lr is the bkpt address + 4; the handler sees pc at the bkpt itself
    sub     r0, lr, #4
    str     r0, [sp, #8+4*15]

    @ sp and lr are banked: fetch them from the interrupted mode,
    @ through system mode when that was user mode
    bic     r8, r10, #0xf
    ands    r9, r11, #0xf
    orreq   r9, r9, #0x1f
    orr     r8, r9
    msr     cpsr_c, r8
    mov     r4, r13
    mov     r5, r14
    msr     cpsr_c, r10
    str     r4, [sp, #8+4*13]
    str     r5, [sp, #8+4*14]

    add     r0, sp, #8
    adr     lr, from_handler
    ldr     r1, =handler_address+1
    bx      r1
from_handler:

    ldr     r11, [sp, #4]           @ regs[-1], possibly changed
    ldr     r0, [sp, #8+4*15]
    add     r0, #hook_instruction_size+1
    str     r0, [sp, #72+4*13]      @ Thumb return address

    @ back to the interrupted mode with the handler's flags
    ldr     r12, =0xf000000f
    bic     r8, r10, r12
    and     r9, r11, r12
    tst     r9, #0xf
    orreq   r9, r9, #0x1f
    orr     r8, r9
    ldr     r4, [sp, #8+4*13]
    ldr     r5, [sp, #8+4*14]
    add     r12, sp, #8
    msr     cpsr_fc, r8
    mov     r13, r4
    mov     r14, r5
    str     r12, regs_pointer
    ldm     r12, {{r0-r12}}

    {relocated}

    @ keep whatever the relocated instruction did to r0-r12 and the flags
    str     r12, relocated_r12
    ldr     r12, regs_pointer
    add     r12, #4*16
    stm     r12, {{r0-r11}}
    ldr     r0, relocated_r12
    str     r0, [r12, #4*12]
    mrs     r11, cpsr
    sub     r12, #8+4*16
    ldr     r10, [r12]
    msr     cpsr_c, r10

    ldr     r1, [sp, #4]
    ldr     r0, =0xf0000000
    bic     r1, r0
    and     r0, r11
    orr     r0, r1
    msr     spsr_cxsf, r0

    add     sp, #8+4*16
    ldmfd   sp!, {{r0-r12, pc}}^
    .pool
regs_pointer:
    .word   0
relocated_r12:
    .word   0
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_aliases_every_register() {
        let source = handler_source("r0 = 0x42");
        assert!(source.contains("uint32_t& r0 = regs[0];"));
        assert!(source.contains("uint32_t& r15 = regs[15];"));
        assert!(source.contains("uint32_t& cpsr = regs[-1];"));
        assert!(source.contains("{ r0 = 0x42; }"));
        assert!(source.starts_with('{') && source.ends_with('}'));
    }

    fn line_of(source: &str, needle: &str) -> usize {
        source
            .lines()
            .position(|l| l.trim_start().starts_with(needle))
            .unwrap_or_else(|| panic!("no `{needle}` in:\n{source}"))
    }

    #[test]
    fn relocated_instruction_runs_in_the_interrupted_mode() {
        let source = isr_source("ldr r0, =0xcafef00d");
        let reloc = line_of(&source, "ldr r0, =0xcafef00d");
        let restore = line_of(&source, "ldm     r12, {r0-r12}");
        let save = line_of(&source, "stm     r12, {r0-r11}");
        assert!(restore < reloc && reloc < save);
        assert!(source.contains("ldmfd   sp!, {r0-r12, pc}^"));
    }

    #[test]
    fn handler_flags_reach_the_relocated_instruction() {
        let source = isr_source("adcs r0, r1");
        let enter = line_of(&source, "msr     cpsr_fc, r8");
        let reloc = line_of(&source, "adcs r0, r1");
        let capture = line_of(&source, "mrs     r11, cpsr");
        assert!(enter < reloc && reloc < capture);
        // Nothing between entering the interrupted mode and capturing the
        // result may touch the flags.
        for line in source.lines().skip(enter + 1).take(capture - enter - 1) {
            let op = line.split_whitespace().next().unwrap_or("");
            assert!(!matches!(op, "tst" | "teq" | "cmp" | "cmn" | "ands" | "orreq"), "{line}");
        }
    }

    #[test]
    fn r12_is_bridged_both_ways() {
        let source = isr_source("mov ip, r0");
        // regs[12] is loaded along with r0-r11 and the pointer is kept aside.
        let stash = line_of(&source, "str     r12, regs_pointer");
        let load = line_of(&source, "ldm     r12, {r0-r12}");
        let reloc = line_of(&source, "mov ip, r0");
        // The result lands in the r12 slot of the return frame.
        let keep = line_of(&source, "str     r12, relocated_r12");
        let reload = line_of(&source, "ldr     r12, regs_pointer");
        let fetch = line_of(&source, "ldr     r0, relocated_r12");
        let store = line_of(&source, "str     r0, [r12, #4*12]");
        let frame = line_of(&source, "add     r12, #4*16");
        assert!(stash < load && load < reloc && reloc < keep && keep < reload);
        assert!(reload < frame && frame < fetch && fetch < store);
        assert!(source.contains("regs_pointer:\n    .word   0"));
        assert!(source.contains("relocated_r12:\n    .word   0"));
    }

    #[test]
    fn relocated_calls_go_through_lr() {
        let source = isr_source("ldr lr, =0x00004001\n    blx lr");
        let call = line_of(&source, "blx lr");
        assert_eq!(line_of(&source, "ldr lr, =0x00004001") + 1, call);
        assert!(call < line_of(&source, "ldr     r12, regs_pointer"));
    }
}
