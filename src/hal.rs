use axaddrspace::{HostPhysAddr, HostVirtAddr};

/// The interfaces which the underlying software (kernel or hypervisor) must implement.
pub trait AxVCpuHal {
    /// Converts a host virtual address to a host physical address.
    ///
    /// Used to hand host buffers to the SBI firmware, which only understands physical
    /// addresses.
    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr;

    /// Fetches current interrupt (IRQ) number.
    ///
    /// Reported in [`AxVCpuExitReason::ExternalInterrupt`](crate::AxVCpuExitReason::ExternalInterrupt)
    /// when a supervisor external interrupt arrives while the guest is running.
    fn irq_fetch() -> usize {
        0
    }
}
