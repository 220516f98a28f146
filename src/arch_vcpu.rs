use axaddrspace::{GuestPhysAddr, HostPhysAddr};
use axerrno::AxResult;

use crate::exit::AxVCpuExitReason;

/// The id of a virtual machine.
pub type VMId = usize;
/// The id of a virtual CPU inside its virtual machine.
pub type VCpuId = usize;

/// Architecture-specific virtual CPU.
///
/// [`AxVCpu`](crate::AxVCpu) drives an implementation of this trait through its lifecycle:
/// `new` → `set_entry` / `set_ept_root` / `setup` → `bind` → `run`* → `unbind`.
/// [`RISCVVCpu`](crate::RISCVVCpu) is the implementation for the RISC-V H extension.
pub trait AxArchVCpu: Sized {
    /// Configuration needed to create the vCPU.
    type CreateConfig;

    /// Configuration consumed by [`AxArchVCpu::setup`].
    type SetupConfig;

    /// Creates a new architecture-specific vCPU instance.
    fn new(vm_id: VMId, vcpu_id: VCpuId, config: Self::CreateConfig) -> AxResult<Self>;

    /// Sets the guest address where execution begins on the first [`AxArchVCpu::run`].
    fn set_entry(&mut self, entry: GuestPhysAddr) -> AxResult;

    /// Sets the root of the second-stage page table translating guest physical addresses.
    ///
    /// On RISC-V this is the G-stage root loaded into `hgatp`.
    fn set_ept_root(&mut self, ept_root: HostPhysAddr) -> AxResult;

    /// Completes initialization. Called once, after the entry and the page table root are set.
    fn setup(&mut self, config: Self::SetupConfig) -> AxResult;

    /// Runs the guest until the next VM exit that needs the hypervisor.
    fn run(&mut self) -> AxResult<AxVCpuExitReason>;

    /// Binds the vCPU to the current physical CPU.
    fn bind(&mut self) -> AxResult;

    /// Unbinds the vCPU from the current physical CPU, saving any per-CPU guest state.
    fn unbind(&mut self) -> AxResult;

    /// Sets the value of an argument register.
    fn set_gpr(&mut self, reg: usize, val: usize);

    /// Injects an interrupt into the vCPU.
    ///
    /// Callers must invoke this on the physical CPU where the vCPU runs or is queued. The vCPU
    /// is not required to be running: the interrupt is buffered until the next entry.
    fn inject_interrupt(&mut self, vector: usize) -> AxResult;

    /// Sets the value returned to the guest by the trapping instruction.
    fn set_return_value(&mut self, val: usize);
}
