use axaddrspace::{device::AccessWidth, GuestPhysAddr, MappingFlags};

#[allow(unused_imports)] // used in doc
use super::AxArchVCpu;

/// The result of [`AxArchVCpu::run`].
#[non_exhaustive]
#[derive(Debug)]
pub enum AxVCpuExitReason {
    /// The guest issued an SBI call with extension id [`EID_HVC`](crate::EID_HVC).
    Hypercall {
        /// The hypercall number, taken from `a6`.
        nr: u64,
        /// The arguments for the hypercall, taken from `a0`-`a5`.
        args: [u64; 6],
    },
    /// The guest loads from an address that is not mapped in the G-stage page table.
    ///
    /// The program counter has already been moved past the faulting instruction. The
    /// hypervisor completes the read with
    /// [`RISCVVCpu::set_gpr_from_gpr_index`](crate::RISCVVCpu::set_gpr_from_gpr_index).
    MmioRead {
        /// The guest physical address of the read.
        addr: GuestPhysAddr,
        /// The width of the read.
        width: AccessWidth,
        /// The index (`x0`-`x31`) of the destination register.
        reg: usize,
        /// The width of the destination register.
        reg_width: AccessWidth,
        /// Whether the loaded value must be sign-extended to `reg_width`.
        signed_ext: bool,
    },
    /// The guest stores to an address that is not mapped in the G-stage page table.
    ///
    /// The program counter has already been moved past the faulting instruction.
    MmioWrite {
        /// The guest physical address of the write.
        addr: GuestPhysAddr,
        /// The width of the write.
        width: AccessWidth,
        /// The data to be written, truncated to `width`.
        data: u64,
    },
    /// An interrupt for the host arrived while the guest was running.
    ExternalInterrupt {
        /// The interrupt vector.
        vector: u64,
    },
    /// A G-stage page fault that is not an emulated MMIO access.
    NestedPageFault {
        /// The guest physical address of the fault.
        addr: GuestPhysAddr,
        /// The access flags of the fault.
        access_flags: MappingFlags,
    },
    /// The vcpu is halted, e.g. on `wfi` or an SBI HSM suspend.
    Halt,
    /// The guest asked to start a secondary hart through SBI HSM `hart_start`.
    ///
    /// The target hart is expected to start at `entry_point` with `a0` set to its hart id
    /// and `a1` set to `arg`.
    CpuUp {
        /// The hart id of the secondary CPU.
        target_cpu: u64,
        /// The guest physical address the secondary hart starts at.
        entry_point: GuestPhysAddr,
        /// The opaque value passed in `a1`.
        arg: u64,
    },
    /// The vcpu is powered off (SBI HSM `hart_stop`).
    ///
    /// This vcpu may be resumed later.
    CpuDown {
        /// Currently unused.
        _state: u64,
    },
    /// The whole system should be powered off (SBI legacy shutdown or SRST).
    SystemDown,
    /// The vcpu has handled the exit itself.
    ///
    /// This exists to allow the caller to have a chance to check virtual devices/physical devices/virtual interrupts.
    Nothing,
    /// The guest sends a software interrupt to other harts (SBI sPI `send_ipi`).
    SendIPI {
        /// Whether all harts are targeted (`hart_mask_base == -1`).
        send_to_all: bool,
        /// Whether only the current hart is targeted. Always `false` on RISC-V.
        send_to_self: bool,
        /// The `hart_mask_base` argument.
        target_cpu: u64,
        /// The `hart_mask` argument, relative to `target_cpu`.
        target_cpu_aux: u64,
        /// The interrupt to deliver on the targets.
        vector: u64,
    },
}
