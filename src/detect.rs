//! Detection of the RISC-V hypervisor extension.
//!
//! The H extension is probed by reading `hgatp`: without the extension the read raises an
//! illegal instruction exception, which a temporary trap vector catches and skips.
//! Guest memory reads with `hlvx` go through the same vector.

#[cfg(target_arch = "riscv64")]
core::arch::global_asm!(
    ".section .text",
    ".balign 4",
    ".global _riscv_vcpu_skip_trap",
    "_riscv_vcpu_skip_trap:",
    // The trapping instruction is never compressed.
    "    csrr t0, sepc",
    "    addi t0, t0, 4",
    "    csrw sepc, t0",
    "    li a0, 1",
    "    sret",
);

/// Address of a trap vector that skips the trapping instruction and sets `a0` to 1.
///
/// Only for use with interrupts masked, around a single 4-byte instruction that may fault.
/// Clobbers `t0` and `a0`.
#[cfg(target_arch = "riscv64")]
pub(crate) fn skip_trap_vector() -> usize {
    extern "C" {
        fn _riscv_vcpu_skip_trap();
    }
    _riscv_vcpu_skip_trap as usize
}

/// Whether the current hart implements the hypervisor extension.
#[cfg(target_arch = "riscv64")]
pub fn detect_h_extension() -> bool {

    let trapped: usize;
    unsafe {
        core::arch::asm!(
            // Mask interrupts so only the probe can reach the temporary vector.
            "csrrci {sstatus}, sstatus, 0x2",
            "csrrw {stvec}, stvec, {vector}",
            "csrr {tmp}, 0x680",
            "csrw stvec, {stvec}",
            "csrw sstatus, {sstatus}",
            sstatus = out(reg) _,
            stvec = out(reg) _,
            tmp = out(reg) _,
            vector = in(reg) skip_trap_vector(),
            inlateout("a0") 0usize => trapped,
            out("t0") _,
        );
    }
    let present = trapped == 0;
    debug!("RISC-V hypervisor extension present: {}", present);
    present
}

/// Whether the current hart implements the hypervisor extension.
#[cfg(not(target_arch = "riscv64"))]
pub fn detect_h_extension() -> bool {
    false
}
