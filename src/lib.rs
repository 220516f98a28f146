// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! RISC-V virtual CPU for ArceOS hypervisors.
//!
//! This crate implements a virtual CPU on top of the RISC-V hypervisor (H) extension. The
//! hypervisor runs in HS-mode and the guest kernel runs in VS-mode; every trap that is not
//! delegated to the guest comes back to the hypervisor as an [`AxVCpuExitReason`].
//!
//! The crate is organized in two layers:
//!
//! - An architecture-neutral layer: the [`AxArchVCpu`] and [`AxArchPerCpu`] traits, the
//!   [`AxVCpu`] state machine (Created → Free → Ready → Running) and the [`AxPerCpu`]
//!   wrapper.
//! - The RISC-V backend: [`RISCVVCpu`] and [`RISCVPerCpu`], with SBI call emulation, MMIO
//!   instruction decoding and the guest world switch.
//!
//! Everything touching hardware only builds for `riscv64`. On other targets the CSR layer
//! falls back to an in-memory register bank so that the trap handling can be tested on the
//! build host.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

// Architecture-neutral layer
mod arch_vcpu;
mod exit;
mod hal;
mod percpu;
mod test;
mod vcpu;

// RISC-V backend. Guest exits are only handled on riscv64, so host builds leave the
// exit handling unused.
pub mod consts;
/// The Control and Status Registers (CSRs) for a RISC-V hypervisor.
pub mod csrs;
mod detect;
#[cfg_attr(not(target_arch = "riscv64"), allow(dead_code))]
mod insn;
mod regs;
mod riscv_percpu;
mod riscv_vcpu;
#[cfg_attr(not(target_arch = "riscv64"), allow(dead_code))]
mod sbi;
#[cfg_attr(not(target_arch = "riscv64"), allow(dead_code))]
mod trap;

pub use arch_vcpu::{AxArchVCpu, VCpuId, VMId};
pub use exit::AxVCpuExitReason;
pub use hal::AxVCpuHal;
pub use percpu::*;
pub use vcpu::*;

pub use self::detect::detect_h_extension as has_hardware_support;
pub use self::regs::{GprIndex, VmCpuRegisters};
pub use self::riscv_percpu::RISCVPerCpu;
pub use self::riscv_vcpu::RISCVVCpu;

/// Extension ID for hypercall, defined by ourselves.
/// `0x48`, `0x56`, `0x43` is "HVC" in ASCII.
///
/// Borrowed from the design of `eid_from_str` in [sbi-spec](https://github.com/rustsbi/rustsbi/blob/62ab2e498ca66cdf75ce049c9dbc2f1862874553/sbi-spec/src/lib.rs#L51)
pub const EID_HVC: usize = 0x485643;

/// Configuration for creating a new `RISCVVCpu`
#[derive(Clone, Debug)]
pub struct RISCVVCpuCreateConfig {
    /// The ID of the vCPU, default to `0`.
    pub hart_id: usize,
    /// The physical address of the device tree blob.
    /// Default to `0x9000_0000`.
    pub dtb_addr: axaddrspace::GuestPhysAddr,
}

impl Default for RISCVVCpuCreateConfig {
    fn default() -> Self {
        Self {
            hart_id: 0,
            dtb_addr: axaddrspace::GuestPhysAddr::from_usize(0x9000_0000),
        }
    }
}
