//! Calls into the SBI firmware running below the hypervisor.

use axaddrspace::HostPhysAddr;
use sbi_spec::binary::SbiRet;

/// Issues `ecall` with extension `eid`, function `fid` and arguments `a0`-`a5`.
#[cfg(target_arch = "riscv64")]
pub fn sbi_call(eid: usize, fid: usize, args: [usize; 6]) -> SbiRet {
    let (error, value): (usize, usize);
    unsafe {
        core::arch::asm!(
            "ecall",
            inlateout("a0") args[0] => error,
            inlateout("a1") args[1] => value,
            in("a2") args[2],
            in("a3") args[3],
            in("a4") args[4],
            in("a5") args[5],
            in("a6") fid,
            in("a7") eid,
        );
    }
    SbiRet { error, value }
}

/// There is no firmware to call outside of RISC-V.
#[cfg(not(target_arch = "riscv64"))]
pub fn sbi_call(eid: usize, fid: usize, _args: [usize; 6]) -> SbiRet {
    trace!("no SBI firmware: eid {:#x} fid {:#x}", eid, fid);
    SbiRet::not_supported()
}

/// Programs the next timer event of the current hart.
pub fn set_timer(stime_value: u64) {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "riscv64")] {
            let ret = sbi_rt::set_timer(stime_value);
            if ret.is_err() {
                warn!("set_timer({:#x}) failed: {:#x}", stime_value, ret.error);
            }
        } else {
            trace!("no SBI firmware: set_timer({:#x})", stime_value);
        }
    }
}

/// Writes one byte to the firmware debug console.
pub fn console_write_byte(byte: u8) -> SbiRet {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "riscv64")] {
            sbi_rt::console_write_byte(byte)
        } else {
            trace!("no SBI firmware: console_write_byte({:#x})", byte);
            SbiRet::not_supported()
        }
    }
}

/// Reads up to `num_bytes` from the firmware debug console into host memory at `paddr`.
///
/// `value` is the number of bytes read.
pub fn console_read(num_bytes: usize, paddr: HostPhysAddr) -> SbiRet {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "riscv64")] {
            sbi_rt::console_read(sbi_rt::Physical::new(num_bytes, paddr.as_usize(), 0))
        } else {
            trace!(
                "no SBI firmware: console_read({}, {:#x})",
                num_bytes,
                paddr.as_usize()
            );
            SbiRet::not_supported()
        }
    }
}
