use core::marker::PhantomData;

use axerrno::{ax_err, AxError, AxResult};

use crate::consts::traps;
use crate::csrs::{RiscvCsrTrait, CSR};
use crate::has_hardware_support;
use crate::{AxArchPerCpu, AxVCpuHal};

/// Exceptions handled by the guest kernel directly, without exiting to the hypervisor.
const DELEGATED_EXCEPTIONS: usize = traps::exception::INST_ADDR_MISALIGN
    | traps::exception::BREAKPOINT
    | traps::exception::ENV_CALL_FROM_U_OR_VU
    | traps::exception::INST_PAGE_FAULT
    | traps::exception::LOAD_PAGE_FAULT
    | traps::exception::STORE_PAGE_FAULT
    | traps::exception::ILLEGAL_INST;

/// VS-level interrupts, injected through `hvip` and delegated to the guest.
const DELEGATED_INTERRUPTS: usize = traps::interrupt::VIRTUAL_SUPERVISOR_TIMER
    | traps::interrupt::VIRTUAL_SUPERVISOR_EXTERNAL
    | traps::interrupt::VIRTUAL_SUPERVISOR_SOFT;

/// Risc-V per-CPU state.
pub struct RISCVPerCpu<H: AxVCpuHal> {
    cpu_id: usize,
    enabled: bool,
    _marker: PhantomData<H>,
}

impl<H: AxVCpuHal> RISCVPerCpu<H> {
    /// The hart this state belongs to.
    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }
}

impl<H: AxVCpuHal> AxArchPerCpu for RISCVPerCpu<H> {
    fn new(cpu_id: usize) -> AxResult<Self> {
        Ok(Self {
            cpu_id,
            enabled: false,
            _marker: PhantomData,
        })
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn hardware_enable(&mut self) -> AxResult<()> {
        if !has_hardware_support() {
            return Err(AxError::Unsupported);
        }
        unsafe {
            setup_csrs();
        }
        self.enabled = true;
        info!("hardware virtualization enabled on hart {}", self.cpu_id);
        Ok(())
    }

    fn hardware_disable(&mut self) -> AxResult<()> {
        if !self.enabled {
            return ax_err!(BadState, "hardware virtualization is not enabled");
        }
        unsafe {
            reset_csrs();
        }
        self.enabled = false;
        info!("hardware virtualization disabled on hart {}", self.cpu_id);
        Ok(())
    }

    /// Guests are translated with Sv39x4.
    fn max_guest_page_table_levels(&self) -> usize {
        3
    }
}

/// Initialize (H)S-level CSRs to a reasonable state.
unsafe fn setup_csrs() {
    // Delegate some synchronous exceptions.
    CSR.hedeleg.write_value(DELEGATED_EXCEPTIONS);

    // Delegate all interupts.
    CSR.hideleg.write_value(DELEGATED_INTERRUPTS);

    // Clear all interrupts.
    CSR.hvip.read_and_clear_bits(DELEGATED_INTERRUPTS);

    // Let VS/VU-mode read all the counters.
    CSR.hcounteren.write_value(usize::MAX);

    // enable interrupt
    CSR.sie.read_and_set_bits(
        traps::interrupt::SUPERVISOR_EXTERNAL
            | traps::interrupt::SUPERVISOR_SOFT
            | traps::interrupt::SUPERVISOR_TIMER,
    );
    debug!(
        "hedeleg: {:#x}, hideleg: {:#x}, sie: {:#x}",
        CSR.hedeleg.get_value(),
        CSR.hideleg.get_value(),
        CSR.sie.get_value()
    );
}

/// Undo the delegation set up by [`setup_csrs`].
unsafe fn reset_csrs() {
    CSR.hedeleg.write_value(0);
    CSR.hideleg.write_value(0);
    CSR.hvip.read_and_clear_bits(DELEGATED_INTERRUPTS);
    CSR.hcounteren.write_value(0);
}
