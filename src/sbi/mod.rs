//! SBI calls issued by the guest kernel.
//!
//! A VS-mode `ecall` lands in the hypervisor with the extension id in `a7`, the function id
//! in `a6` and the arguments in `a0`-`a5`. [`SbiCall::from_regs`] sorts it into the calls
//! the vCPU emulates itself and the ones forwarded to the firmware.

mod forward;
mod rfnc;

pub use forward::{console_read, console_write_byte, sbi_call, set_timer};
pub use rfnc::RemoteFenceFunction;

use sbi_spec::{base, hsm, legacy, rfnc as rfnc_spec, spi, srst, time};

use crate::EID_HVC;

/// A decoded guest SBI call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SbiCall {
    /// `sbi_set_timer`, legacy extension.
    LegacySetTimer(u64),
    /// `sbi_console_putchar`, legacy extension.
    LegacyPutchar(u8),
    /// `sbi_console_getchar`, legacy extension.
    LegacyGetchar,
    /// `sbi_shutdown`, legacy extension.
    LegacyShutdown,
    /// Any other legacy call (IPIs and remote fences).
    LegacyUnsupported(usize),
    /// TIME `sbi_set_timer`.
    SetTimer(u64),
    /// HSM `sbi_hart_start`.
    HartStart {
        hartid: usize,
        start_addr: usize,
        opaque: usize,
    },
    /// HSM `sbi_hart_stop`.
    HartStop,
    /// HSM `sbi_hart_suspend`.
    HartSuspend {
        suspend_type: usize,
        resume_addr: usize,
        opaque: usize,
    },
    /// SRST `sbi_system_reset`.
    SystemReset { reset_type: usize, reset_reason: usize },
    /// sPI `sbi_send_ipi`.
    SendIpi {
        hart_mask: usize,
        hart_mask_base: usize,
    },
    /// A valid RFNC call.
    RemoteFence(RemoteFenceFunction),
    /// BASE `sbi_probe_extension`.
    ProbeExtension(usize),
    /// A call to [`EID_HVC`].
    Hypercall { nr: usize, args: [usize; 6] },
    /// A call of an emulated extension with a function the vCPU does not provide.
    Unsupported { eid: usize, fid: usize },
    /// Anything else, passed to the firmware unchanged.
    Forward {
        eid: usize,
        fid: usize,
        args: [usize; 6],
    },
}

impl SbiCall {
    /// Decodes the call from the guest's `a0`-`a7`.
    pub fn from_regs(a: &[usize]) -> Self {
        let args = [a[0], a[1], a[2], a[3], a[4], a[5]];
        let fid = a[6];
        let eid = a[7];

        match eid {
            legacy::LEGACY_SET_TIMER => Self::LegacySetTimer(a[0] as u64),
            legacy::LEGACY_CONSOLE_PUTCHAR => Self::LegacyPutchar(a[0] as u8),
            legacy::LEGACY_CONSOLE_GETCHAR => Self::LegacyGetchar,
            legacy::LEGACY_SHUTDOWN => Self::LegacyShutdown,
            legacy::LEGACY_CLEAR_IPI..=legacy::LEGACY_REMOTE_SFENCE_VMA_ASID => {
                Self::LegacyUnsupported(eid)
            }
            time::EID_TIME => match fid {
                time::SET_TIMER => Self::SetTimer(a[0] as u64),
                _ => Self::Unsupported { eid, fid },
            },
            hsm::EID_HSM => match fid {
                hsm::HART_START => Self::HartStart {
                    hartid: a[0],
                    start_addr: a[1],
                    opaque: a[2],
                },
                hsm::HART_STOP => Self::HartStop,
                hsm::HART_SUSPEND => Self::HartSuspend {
                    suspend_type: a[0],
                    resume_addr: a[1],
                    opaque: a[2],
                },
                _ => Self::Unsupported { eid, fid },
            },
            srst::EID_SRST => match fid {
                srst::SYSTEM_RESET => Self::SystemReset {
                    reset_type: a[0],
                    reset_reason: a[1],
                },
                _ => Self::Unsupported { eid, fid },
            },
            spi::EID_SPI => match fid {
                spi::SEND_IPI => Self::SendIpi {
                    hart_mask: a[0],
                    hart_mask_base: a[1],
                },
                _ => Self::Unsupported { eid, fid },
            },
            rfnc_spec::EID_RFNC => match RemoteFenceFunction::from_args(a) {
                Ok(function) => Self::RemoteFence(function),
                Err(_) => Self::Unsupported { eid, fid },
            },
            base::EID_BASE if fid == base::PROBE_EXTENSION => Self::ProbeExtension(a[0]),
            EID_HVC => Self::Hypercall { nr: fid, args },
            _ => Self::Forward { eid, fid, args },
        }
    }
}

/// Whether the extension `eid` is provided by the vCPU rather than the firmware.
pub fn is_emulated_extension(eid: usize) -> bool {
    matches!(
        eid,
        legacy::LEGACY_SET_TIMER..=legacy::LEGACY_SHUTDOWN
            | base::EID_BASE
            | time::EID_TIME
            | hsm::EID_HSM
            | srst::EID_SRST
            | spi::EID_SPI
            | rfnc_spec::EID_RFNC
            | EID_HVC
    )
}
