use core::marker::PhantomData;

use axaddrspace::device::AccessWidth;
use axaddrspace::{GuestPhysAddr, HostPhysAddr, HostVirtAddr, MappingFlags};
use axerrno::{ax_err, AxError, AxResult};
use sbi_spec::binary::SbiRet;
use tock_registers::interfaces::Readable;

use crate::consts::traps;
use crate::csrs::defs::hstatus;
use crate::csrs::{RiscvCsrTrait, CSR};
#[cfg(target_arch = "riscv64")]
use crate::insn::insn_len;
use crate::insn::{width_mask, MmioInstruction, MmioKind, INSN_WFI};
use crate::regs::{GprIndex, VmCpuRegisters};
use crate::sbi::{self, SbiCall};
use crate::trap::{Exception, Interrupt, Trap};
use crate::{AxArchVCpu, AxVCpuExitReason, AxVCpuHal, RISCVVCpuCreateConfig, VCpuId, VMId};

const SSTATUS_SIE: usize = 1 << 1;
const SSTATUS_SPP: usize = 1 << 8;

/// `hgatp.MODE` for Sv39x4.
const HGATP_MODE_SV39X4: usize = 8 << 60;

/// The Sv39x4 root table spans four pages and must be 16 KiB aligned.
const SV39X4_ROOT_ALIGN: usize = 0x4000;

/// Interrupt bits of `hvip` the hypervisor may assert for the guest.
const VIRTUAL_INTERRUPTS: usize = traps::interrupt::VIRTUAL_SUPERVISOR_SOFT
    | traps::interrupt::VIRTUAL_SUPERVISOR_TIMER
    | traps::interrupt::VIRTUAL_SUPERVISOR_EXTERNAL;

#[cfg(target_arch = "riscv64")]
mod switch {
    use core::mem::size_of;

    use memoffset::offset_of;

    use crate::regs::{GprIndex, GuestCpuState, HypervisorCpuState, VmCpuRegisters};

    const fn hyp_gpr_offset(index: GprIndex) -> usize {
        offset_of!(VmCpuRegisters, hyp_regs)
            + offset_of!(HypervisorCpuState, gprs)
            + (index as usize) * size_of::<usize>()
    }

    const fn guest_gpr_offset(index: GprIndex) -> usize {
        offset_of!(VmCpuRegisters, guest_regs)
            + offset_of!(GuestCpuState, gprs)
            + (index as usize) * size_of::<usize>()
    }

    macro_rules! hyp_csr_offset {
        ($reg:tt) => {
            offset_of!(VmCpuRegisters, hyp_regs) + offset_of!(HypervisorCpuState, $reg)
        };
    }

    macro_rules! guest_csr_offset {
        ($reg:tt) => {
            offset_of!(VmCpuRegisters, guest_regs) + offset_of!(GuestCpuState, $reg)
        };
    }

    core::arch::global_asm!(
        include_str!("guest.S"),
        hyp_ra = const hyp_gpr_offset(GprIndex::RA),
        hyp_gp = const hyp_gpr_offset(GprIndex::GP),
        hyp_tp = const hyp_gpr_offset(GprIndex::TP),
        hyp_s0 = const hyp_gpr_offset(GprIndex::S0),
        hyp_s1 = const hyp_gpr_offset(GprIndex::S1),
        hyp_s2 = const hyp_gpr_offset(GprIndex::S2),
        hyp_s3 = const hyp_gpr_offset(GprIndex::S3),
        hyp_s4 = const hyp_gpr_offset(GprIndex::S4),
        hyp_s5 = const hyp_gpr_offset(GprIndex::S5),
        hyp_s6 = const hyp_gpr_offset(GprIndex::S6),
        hyp_s7 = const hyp_gpr_offset(GprIndex::S7),
        hyp_s8 = const hyp_gpr_offset(GprIndex::S8),
        hyp_s9 = const hyp_gpr_offset(GprIndex::S9),
        hyp_s10 = const hyp_gpr_offset(GprIndex::S10),
        hyp_s11 = const hyp_gpr_offset(GprIndex::S11),
        hyp_sp = const hyp_gpr_offset(GprIndex::SP),
        hyp_sstatus = const hyp_csr_offset!(sstatus),
        hyp_hstatus = const hyp_csr_offset!(hstatus),
        hyp_scounteren = const hyp_csr_offset!(scounteren),
        hyp_stvec = const hyp_csr_offset!(stvec),
        hyp_sscratch = const hyp_csr_offset!(sscratch),
        guest_ra = const guest_gpr_offset(GprIndex::RA),
        guest_sp = const guest_gpr_offset(GprIndex::SP),
        guest_gp = const guest_gpr_offset(GprIndex::GP),
        guest_tp = const guest_gpr_offset(GprIndex::TP),
        guest_t0 = const guest_gpr_offset(GprIndex::T0),
        guest_t1 = const guest_gpr_offset(GprIndex::T1),
        guest_t2 = const guest_gpr_offset(GprIndex::T2),
        guest_s0 = const guest_gpr_offset(GprIndex::S0),
        guest_s1 = const guest_gpr_offset(GprIndex::S1),
        guest_a0 = const guest_gpr_offset(GprIndex::A0),
        guest_a1 = const guest_gpr_offset(GprIndex::A1),
        guest_a2 = const guest_gpr_offset(GprIndex::A2),
        guest_a3 = const guest_gpr_offset(GprIndex::A3),
        guest_a4 = const guest_gpr_offset(GprIndex::A4),
        guest_a5 = const guest_gpr_offset(GprIndex::A5),
        guest_a6 = const guest_gpr_offset(GprIndex::A6),
        guest_a7 = const guest_gpr_offset(GprIndex::A7),
        guest_s2 = const guest_gpr_offset(GprIndex::S2),
        guest_s3 = const guest_gpr_offset(GprIndex::S3),
        guest_s4 = const guest_gpr_offset(GprIndex::S4),
        guest_s5 = const guest_gpr_offset(GprIndex::S5),
        guest_s6 = const guest_gpr_offset(GprIndex::S6),
        guest_s7 = const guest_gpr_offset(GprIndex::S7),
        guest_s8 = const guest_gpr_offset(GprIndex::S8),
        guest_s9 = const guest_gpr_offset(GprIndex::S9),
        guest_s10 = const guest_gpr_offset(GprIndex::S10),
        guest_s11 = const guest_gpr_offset(GprIndex::S11),
        guest_t3 = const guest_gpr_offset(GprIndex::T3),
        guest_t4 = const guest_gpr_offset(GprIndex::T4),
        guest_t5 = const guest_gpr_offset(GprIndex::T5),
        guest_t6 = const guest_gpr_offset(GprIndex::T6),
        guest_sstatus = const guest_csr_offset!(sstatus),
        guest_hstatus = const guest_csr_offset!(hstatus),
        guest_scounteren = const guest_csr_offset!(scounteren),
        guest_sepc = const guest_csr_offset!(sepc),
    );

    extern "C" {
        /// Enters the guest described by `state` and returns on the next trap to HS-mode.
        pub fn _run_guest(state: *mut VmCpuRegisters);
    }
}

/// Flushes G-stage translations of all guests on this hart.
fn hfence_gvma_all() {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "riscv64")] {
            // hfence.gvma zero, zero
            unsafe { core::arch::asm!(".word 0x62000073") };
        }
    }
}

/// A virtual CPU within a guest, running in VS-mode.
pub struct RISCVVCpu<H: AxVCpuHal> {
    regs: VmCpuRegisters,
    /// `hvip` bits queued by [`AxArchVCpu::inject_interrupt`] for the next entry.
    pending_interrupts: usize,
    vm_id: VMId,
    vcpu_id: VCpuId,
    _marker: PhantomData<H>,
}

impl<H: AxVCpuHal> AxArchVCpu for RISCVVCpu<H> {
    type CreateConfig = RISCVVCpuCreateConfig;

    type SetupConfig = ();

    fn new(vm_id: VMId, vcpu_id: VCpuId, config: Self::CreateConfig) -> AxResult<Self> {
        let mut regs = VmCpuRegisters::default();
        // `a0` is the hartid
        regs.guest_regs.gprs.set_reg(GprIndex::A0, config.hart_id);
        // `a1` is the address of the device tree blob.
        regs.guest_regs
            .gprs
            .set_reg(GprIndex::A1, config.dtb_addr.as_usize());

        Ok(Self {
            regs,
            pending_interrupts: 0,
            vm_id,
            vcpu_id,
            _marker: PhantomData,
        })
    }

    fn setup(&mut self, _config: Self::SetupConfig) -> AxResult {
        // Return to VS-mode with interrupts masked until the guest enables them.
        let sstatus = CSR.sstatus.get_value();
        self.regs.guest_regs.sstatus = (sstatus | SSTATUS_SPP) & !SSTATUS_SIE;

        let mut guest_hstatus = CSR.hstatus.extract();
        guest_hstatus.modify(hstatus::spv::Supervisor + hstatus::spvp::Supervisor);
        self.regs.guest_regs.hstatus = guest_hstatus.get();
        debug!(
            "VCpu[{}:{}] setup: sstatus {:#x} hstatus {:#x}",
            self.vm_id, self.vcpu_id, self.regs.guest_regs.sstatus, self.regs.guest_regs.hstatus
        );
        Ok(())
    }

    fn set_entry(&mut self, entry: GuestPhysAddr) -> AxResult {
        self.regs.guest_regs.sepc = entry.as_usize();
        Ok(())
    }

    fn set_ept_root(&mut self, ept_root: HostPhysAddr) -> AxResult {
        if !memory_addr::is_aligned(ept_root.as_usize(), SV39X4_ROOT_ALIGN) {
            return ax_err!(InvalidInput, "G-stage page table root is not 16K aligned");
        }
        self.regs.virtual_hs_csrs.hgatp = HGATP_MODE_SV39X4 | ept_root.as_usize() >> 12;
        Ok(())
    }

    fn run(&mut self) -> AxResult<AxVCpuExitReason> {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "riscv64")] {
                self.flush_pending_interrupts();
                let sie = CSR.sstatus.read_and_clear_bits(SSTATUS_SIE) & SSTATUS_SIE;
                unsafe {
                    // Safe to run the guest as it only touches memory assigned to it by being owned
                    // by its page table
                    switch::_run_guest(&mut self.regs);
                }
                self.regs.trap_csrs.scause = CSR.scause.get_value();
                self.regs.trap_csrs.stval = CSR.stval.get_value();
                self.regs.trap_csrs.htval = CSR.htval.get_value();
                self.regs.trap_csrs.htinst = CSR.htinst.get_value();

                let result = self.vmexit_handler();
                if sie != 0 {
                    CSR.sstatus.read_and_set_bits(SSTATUS_SIE);
                }
                result
            } else {
                Err(AxError::Unsupported)
            }
        }
    }

    fn bind(&mut self) -> AxResult {
        CSR.hgatp.write_value(self.regs.virtual_hs_csrs.hgatp);
        self.restore_vs_csrs();
        self.flush_pending_interrupts();
        hfence_gvma_all();
        Ok(())
    }

    fn unbind(&mut self) -> AxResult {
        self.save_vs_csrs();
        // Asserted virtual interrupts belong to this vcpu, not to the hart.
        self.pending_interrupts |=
            CSR.hvip.read_and_clear_bits(VIRTUAL_INTERRUPTS) & VIRTUAL_INTERRUPTS;
        Ok(())
    }

    /// Set one of the argument registers `a0`-`a7`.
    fn set_gpr(&mut self, index: usize, val: usize) {
        match index {
            0..=7 => {
                if let Some(reg) = GprIndex::from_raw(GprIndex::A0 as u32 + index as u32) {
                    self.set_gpr_from_gpr_index(reg, val);
                }
            }
            _ => {
                warn!(
                    "RISCVVCpu: Unsupported general purpose register index: {}",
                    index
                );
            }
        }
    }

    fn inject_interrupt(&mut self, vector: usize) -> AxResult {
        self.pending_interrupts |= Self::hvip_bit(vector)?;
        Ok(())
    }

    fn set_return_value(&mut self, val: usize) {
        self.set_gpr_from_gpr_index(GprIndex::A0, val);
    }
}

impl<H: AxVCpuHal> RISCVVCpu<H> {
    /// Gets one of the vCPU's general purpose registers.
    pub fn get_gpr(&self, index: GprIndex) -> usize {
        self.regs.guest_regs.gprs.reg(index)
    }

    /// Set one of the vCPU's general purpose register.
    pub fn set_gpr_from_gpr_index(&mut self, index: GprIndex, val: usize) {
        self.regs.guest_regs.gprs.set_reg(index, val);
    }

    /// Advance guest pc by `instr_len` bytes
    pub fn advance_pc(&mut self, instr_len: usize) {
        self.regs.guest_regs.sepc += instr_len
    }

    /// Gets the vCPU's registers.
    pub fn regs(&mut self) -> &mut VmCpuRegisters {
        &mut self.regs
    }

    /// Withdraws an interrupt raised by [`AxArchVCpu::inject_interrupt`], whether it is still
    /// queued or already asserted in `hvip`.
    pub fn clear_interrupt(&mut self, vector: usize) -> AxResult {
        let bit = Self::hvip_bit(vector)?;
        self.pending_interrupts &= !bit;
        CSR.hvip.read_and_clear_bits(bit);
        Ok(())
    }

    /// Maps an interrupt cause number to its VS-level bit in `hvip`.
    ///
    /// Both the supervisor and the virtual supervisor numbering are accepted.
    fn hvip_bit(vector: usize) -> AxResult<usize> {
        match vector {
            1 | 2 => Ok(traps::interrupt::VIRTUAL_SUPERVISOR_SOFT),
            5 | 6 => Ok(traps::interrupt::VIRTUAL_SUPERVISOR_TIMER),
            9 | 10 => Ok(traps::interrupt::VIRTUAL_SUPERVISOR_EXTERNAL),
            _ => ax_err!(InvalidInput, "interrupt vector cannot be injected"),
        }
    }

    fn flush_pending_interrupts(&mut self) {
        if self.pending_interrupts != 0 {
            CSR.hvip
                .read_and_set_bits(self.pending_interrupts & VIRTUAL_INTERRUPTS);
            self.pending_interrupts = 0;
        }
    }

    fn save_vs_csrs(&mut self) {
        let vs = &mut self.regs.vs_csrs;
        vs.htimedelta = CSR.htimedelta.get_value();
        vs.vsstatus = CSR.vsstatus.get_value();
        vs.vsie = CSR.vsie.get_value();
        vs.vstvec = CSR.vstvec.get_value();
        vs.vsscratch = CSR.vsscratch.get_value();
        vs.vsepc = CSR.vsepc.get_value();
        vs.vscause = CSR.vscause.get_value();
        vs.vstval = CSR.vstval.get_value();
        vs.vsatp = CSR.vsatp.get_value();
    }

    fn restore_vs_csrs(&self) {
        let vs = &self.regs.vs_csrs;
        CSR.htimedelta.write_value(vs.htimedelta);
        CSR.vsstatus.write_value(vs.vsstatus);
        CSR.vsie.write_value(vs.vsie);
        CSR.vstvec.write_value(vs.vstvec);
        CSR.vsscratch.write_value(vs.vsscratch);
        CSR.vsepc.write_value(vs.vsepc);
        CSR.vscause.write_value(vs.vscause);
        CSR.vstval.write_value(vs.vstval);
        CSR.vsatp.write_value(vs.vsatp);
    }
}

#[cfg_attr(not(target_arch = "riscv64"), allow(dead_code))]
impl<H: AxVCpuHal> RISCVVCpu<H> {
    fn vmexit_handler(&mut self) -> AxResult<AxVCpuExitReason> {
        let trap = Trap::from_scause(self.regs.trap_csrs.scause);
        trace!(
            "vmexit_handler: {:?}, sepc: {:#x}, stval: {:#x}",
            trap,
            self.regs.guest_regs.sepc,
            self.regs.trap_csrs.stval
        );
        self.handle_trap(trap)
    }

    fn handle_trap(&mut self, trap: Trap) -> AxResult<AxVCpuExitReason> {
        match trap {
            Trap::Exception(Exception::VirtualSupervisorEnvCall) => self.handle_sbi_call(),
            Trap::Interrupt(Interrupt::SupervisorTimer) => {
                // Enable guest timer interrupt
                CSR.hvip
                    .read_and_set_bits(traps::interrupt::VIRTUAL_SUPERVISOR_TIMER);
                // Clear host timer interrupt
                CSR.sie
                    .read_and_clear_bits(traps::interrupt::SUPERVISOR_TIMER);
                Ok(AxVCpuExitReason::Nothing)
            }
            Trap::Interrupt(Interrupt::SupervisorExternal) => {
                Ok(AxVCpuExitReason::ExternalInterrupt {
                    vector: H::irq_fetch() as u64,
                })
            }
            Trap::Interrupt(Interrupt::SupervisorSoft) => Ok(AxVCpuExitReason::ExternalInterrupt {
                vector: traps::irq::S_SOFT as u64,
            }),
            Trap::Exception(Exception::LoadGuestPageFault) => self.handle_guest_page_fault(false),
            Trap::Exception(Exception::StoreGuestPageFault) => self.handle_guest_page_fault(true),
            Trap::Exception(Exception::InstructionGuestPageFault) => {
                Ok(AxVCpuExitReason::NestedPageFault {
                    addr: self.guest_fault_addr(),
                    access_flags: MappingFlags::EXECUTE,
                })
            }
            Trap::Exception(Exception::VirtualInstruction) => {
                let insn = match self.regs.trap_csrs.stval {
                    0 => self.fetch_guest_insn(self.regs.guest_regs.sepc),
                    stval => Some(stval as u32),
                };
                if insn == Some(INSN_WFI) {
                    self.advance_pc(4);
                    return Ok(AxVCpuExitReason::Halt);
                }
                self.unhandled_trap(trap)
            }
            _ => self.unhandled_trap(trap),
        }
    }

    fn unhandled_trap(&self, trap: Trap) -> AxResult<AxVCpuExitReason> {
        error!(
            "VCpu[{}:{}] unhandled trap: {:?}, sepc: {:#x}, stval: {:#x}, htval: {:#x}",
            self.vm_id,
            self.vcpu_id,
            trap,
            self.regs.guest_regs.sepc,
            self.regs.trap_csrs.stval,
            self.regs.trap_csrs.htval
        );
        Err(AxError::Unsupported)
    }

    /// The guest physical address of a G-stage fault: `htval` holds it shifted right by 2.
    fn guest_fault_addr(&self) -> GuestPhysAddr {
        let trap_csrs = &self.regs.trap_csrs;
        GuestPhysAddr::from(trap_csrs.htval << 2 | trap_csrs.stval & 0x3)
    }

    fn handle_guest_page_fault(&mut self, is_store: bool) -> AxResult<AxVCpuExitReason> {
        let addr = self.guest_fault_addr();
        let insn = MmioInstruction::from_htinst(self.regs.trap_csrs.htinst).or_else(|| {
            self.fetch_guest_insn(self.regs.guest_regs.sepc)
                .and_then(MmioInstruction::decode)
        });

        match insn {
            Some(MmioInstruction {
                kind: MmioKind::Load { signed },
                width,
                reg,
                len,
            }) if !is_store => {
                self.advance_pc(len);
                Ok(AxVCpuExitReason::MmioRead {
                    addr,
                    width,
                    reg: reg as usize,
                    reg_width: AccessWidth::Qword,
                    signed_ext: signed,
                })
            }
            Some(MmioInstruction {
                kind: MmioKind::Store,
                width,
                reg,
                len,
            }) if is_store => {
                let data = self.get_gpr(reg) as u64 & width_mask(width);
                self.advance_pc(len);
                Ok(AxVCpuExitReason::MmioWrite { addr, width, data })
            }
            _ => Ok(AxVCpuExitReason::NestedPageFault {
                addr,
                access_flags: if is_store {
                    MappingFlags::WRITE
                } else {
                    MappingFlags::READ
                },
            }),
        }
    }

    /// Reads the instruction at guest virtual address `pc`, translated with the guest's own
    /// page tables. `None` if the read faults.
    #[cfg(target_arch = "riscv64")]
    fn fetch_guest_insn(&self, pc: usize) -> Option<u32> {
        const HSTATUS_SPVP: usize = 1 << 8;

        // The host `hstatus` is live here, so SPVP is set for the access to use VS privilege.
        fn hlvx_hu(addr: usize) -> Option<u16> {
            let value: usize;
            let trapped: usize;
            unsafe {
                core::arch::asm!(
                    "csrrci {sstatus}, sstatus, 0x2",
                    "csrrw {stvec}, stvec, {vector}",
                    "csrrs {hstatus}, 0x600, {spvp}",
                    // hlvx.hu {value}, ({addr})
                    ".insn r 0x73, 0x4, 0x32, {value}, {addr}, x3",
                    "csrw 0x600, {hstatus}",
                    "csrw stvec, {stvec}",
                    "csrw sstatus, {sstatus}",
                    sstatus = out(reg) _,
                    stvec = out(reg) _,
                    hstatus = out(reg) _,
                    value = out(reg) value,
                    addr = in(reg) addr,
                    spvp = in(reg) HSTATUS_SPVP,
                    vector = in(reg) crate::detect::skip_trap_vector(),
                    inout("a0") 0usize => trapped,
                    out("t0") _,
                );
            }
            if trapped != 0 {
                debug!("guest instruction fetch at {:#x} faulted", addr);
                return None;
            }
            Some(value as u16)
        }

        let low = hlvx_hu(pc)?;
        if insn_len(low) == 4 {
            Some(low as u32 | (hlvx_hu(pc + 2)? as u32) << 16)
        } else {
            Some(low as u32)
        }
    }

    /// There is no guest memory to read outside of RISC-V.
    #[cfg(not(target_arch = "riscv64"))]
    fn fetch_guest_insn(&self, pc: usize) -> Option<u32> {
        trace!("cannot fetch guest instruction at {:#x}", pc);
        None
    }
}

// SBI emulation.
#[cfg_attr(not(target_arch = "riscv64"), allow(dead_code))]
impl<H: AxVCpuHal> RISCVVCpu<H> {
    fn handle_sbi_call(&mut self) -> AxResult<AxVCpuExitReason> {
        let call = SbiCall::from_regs(self.regs.guest_regs.gprs.a_regs());
        trace!("VCpu[{}:{}] sbi call {:x?}", self.vm_id, self.vcpu_id, call);

        match call {
            SbiCall::LegacySetTimer(stime_value) => {
                self.set_timer(stime_value);
                self.set_gpr_from_gpr_index(GprIndex::A0, 0);
            }
            SbiCall::SetTimer(stime_value) => {
                self.set_timer(stime_value);
                self.set_sbi_ret(SbiRet::success(0));
            }
            SbiCall::LegacyPutchar(c) => {
                let ret = sbi::console_write_byte(c);
                // Legacy calls only return `a0`.
                self.set_gpr_from_gpr_index(GprIndex::A0, ret.error);
            }
            SbiCall::LegacyGetchar => {
                let c = self.console_getchar();
                self.set_gpr_from_gpr_index(GprIndex::A0, c);
            }
            SbiCall::LegacyShutdown | SbiCall::SystemReset { .. } => {
                info!("VCpu[{}:{}] requested system shutdown", self.vm_id, self.vcpu_id);
                return Ok(AxVCpuExitReason::SystemDown);
            }
            SbiCall::LegacyUnsupported(eid) => {
                warn!("Unsupported SBI legacy extension id {:#x}", eid);
                self.set_gpr_from_gpr_index(GprIndex::A0, SbiRet::not_supported().error);
            }
            SbiCall::HartStart {
                hartid,
                start_addr,
                opaque,
            } => {
                self.set_sbi_ret(SbiRet::success(0));
                self.advance_pc(4);
                return Ok(AxVCpuExitReason::CpuUp {
                    target_cpu: hartid as u64,
                    entry_point: GuestPhysAddr::from(start_addr),
                    arg: opaque as u64,
                });
            }
            SbiCall::HartStop => return Ok(AxVCpuExitReason::CpuDown { _state: 0 }),
            SbiCall::HartSuspend { .. } => {
                // TODO: resume at `resume_addr` for non-retentive suspend types.
                self.set_sbi_ret(SbiRet::success(0));
                self.advance_pc(4);
                return Ok(AxVCpuExitReason::Halt);
            }
            SbiCall::SendIpi {
                hart_mask,
                hart_mask_base,
            } => {
                self.set_sbi_ret(SbiRet::success(0));
                self.advance_pc(4);
                return Ok(AxVCpuExitReason::SendIPI {
                    send_to_all: hart_mask_base == usize::MAX,
                    send_to_self: false,
                    target_cpu: hart_mask_base as u64,
                    target_cpu_aux: hart_mask as u64,
                    vector: traps::irq::S_SOFT as u64,
                });
            }
            SbiCall::RemoteFence(function) => {
                trace!("forward remote fence {:x?}", function);
                let ret = self.forward_current_call();
                self.set_sbi_ret(ret);
            }
            SbiCall::ProbeExtension(eid) if sbi::is_emulated_extension(eid) => {
                self.set_sbi_ret(SbiRet::success(1));
            }
            SbiCall::ProbeExtension(_) => {
                let ret = self.forward_current_call();
                self.set_sbi_ret(ret);
            }
            SbiCall::Hypercall { nr, args } => {
                self.advance_pc(4);
                return Ok(AxVCpuExitReason::Hypercall {
                    nr: nr as u64,
                    args: args.map(|arg| arg as u64),
                });
            }
            SbiCall::Unsupported { eid, fid } => {
                warn!(
                    "Unsupported SBI call: eid {:#x} fid {:#x}, return NOT_SUPPORTED",
                    eid, fid
                );
                self.set_sbi_ret(SbiRet::not_supported());
            }
            SbiCall::Forward { eid, fid, args } => {
                let ret = sbi::sbi_call(eid, fid, args);
                if ret.is_err() {
                    warn!(
                        "forward ecall eid {:#x} fid {:#x} param {:#x?} err {:#x} value {:#x}",
                        eid, fid, args, ret.error, ret.value
                    );
                }
                self.set_sbi_ret(ret);
            }
        }

        self.advance_pc(4);
        Ok(AxVCpuExitReason::Nothing)
    }

    fn set_sbi_ret(&mut self, ret: SbiRet) {
        self.set_gpr_from_gpr_index(GprIndex::A0, ret.error);
        self.set_gpr_from_gpr_index(GprIndex::A1, ret.value);
    }

    /// Passes the call in `a0`-`a7` to the firmware unchanged.
    fn forward_current_call(&self) -> SbiRet {
        let a = self.regs.guest_regs.gprs.a_regs();
        sbi::sbi_call(a[7], a[6], [a[0], a[1], a[2], a[3], a[4], a[5]])
    }

    fn set_timer(&mut self, stime_value: u64) {
        sbi::set_timer(stime_value);
        // Clear guest timer interrupt
        self.pending_interrupts &= !traps::interrupt::VIRTUAL_SUPERVISOR_TIMER;
        CSR.hvip
            .read_and_clear_bits(traps::interrupt::VIRTUAL_SUPERVISOR_TIMER);
        //  Enable host timer interrupt
        CSR.sie
            .read_and_set_bits(traps::interrupt::SUPERVISOR_TIMER);
    }

    /// Reads one byte from the firmware console, `usize::MAX` (-1) if none is available.
    fn console_getchar(&self) -> usize {
        let mut c: u8 = 0;
        let buf = core::ptr::addr_of_mut!(c);
        let paddr = H::virt_to_phys(HostVirtAddr::from(buf as usize));
        let ret = sbi::console_read(1, paddr);
        if ret.is_ok() && ret.value == 1 {
            // SAFETY: the firmware has written one byte to `buf`.
            unsafe { buf.read_volatile() as usize }
        } else {
            if ret.is_err() {
                warn!(
                    "LEGACY_CONSOLE_GETCHAR err {:#x} value {:#x}",
                    ret.error, ret.value
                );
            }
            usize::MAX
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EID_HVC;
    use sbi_spec::{base, hsm, legacy, spi, srst, time};

    struct MockHal;

    impl AxVCpuHal for MockHal {
        fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr {
            HostPhysAddr::from(vaddr.as_usize())
        }

        fn irq_fetch() -> usize {
            33
        }
    }

    type VCpu = RISCVVCpu<MockHal>;

    const ENTRY: usize = 0x8020_0000;

    fn new_vcpu() -> VCpu {
        let config = RISCVVCpuCreateConfig {
            hart_id: 2,
            dtb_addr: GuestPhysAddr::from(0x8200_0000),
        };
        let mut vcpu = VCpu::new(1, 2, config).unwrap();
        vcpu.set_entry(GuestPhysAddr::from(ENTRY)).unwrap();
        vcpu
    }

    fn pc(vcpu: &VCpu) -> usize {
        vcpu.regs.guest_regs.sepc
    }

    fn ecall(vcpu: &mut VCpu, eid: usize, fid: usize, args: [usize; 6]) -> AxVCpuExitReason {
        let a = vcpu.regs.guest_regs.gprs.a_regs_mut();
        a[..6].copy_from_slice(&args);
        a[6] = fid;
        a[7] = eid;
        vcpu.regs.trap_csrs.scause = 10;
        vcpu.vmexit_handler().unwrap()
    }

    fn guest_page_fault(vcpu: &mut VCpu, scause: usize, gpa: usize, htinst: usize) -> AxVCpuExitReason {
        vcpu.regs.trap_csrs = crate::regs::VmCpuTrapState {
            scause,
            stval: gpa & 0x3,
            htval: gpa >> 2,
            htinst,
        };
        vcpu.vmexit_handler().unwrap()
    }

    #[test]
    fn new_passes_hart_id_and_dtb() {
        let vcpu = new_vcpu();
        assert_eq!(vcpu.get_gpr(GprIndex::A0), 2);
        assert_eq!(vcpu.get_gpr(GprIndex::A1), 0x8200_0000);
        assert_eq!(pc(&vcpu), ENTRY);
    }

    #[test]
    fn setup_returns_to_vs_mode() {
        let _guard = crate::test::serial();
        CSR.sstatus.write_value(SSTATUS_SIE);
        CSR.hstatus.write_value(0);

        let mut vcpu = new_vcpu();
        vcpu.setup(()).unwrap();
        assert_eq!(vcpu.regs.guest_regs.sstatus & SSTATUS_SIE, 0);
        assert_ne!(vcpu.regs.guest_regs.sstatus & SSTATUS_SPP, 0);
        // SPV and SPVP
        assert_eq!(vcpu.regs.guest_regs.hstatus, (1 << 7) | (1 << 8));
    }

    #[test]
    fn ept_root_must_be_aligned() {
        let mut vcpu = new_vcpu();
        assert_eq!(
            vcpu.set_ept_root(HostPhysAddr::from(0x8100_0800)),
            Err(AxError::InvalidInput)
        );
        // Page aligned is not enough: hgatp.PPN[1:0] is always zero for Sv39x4.
        assert_eq!(
            vcpu.set_ept_root(HostPhysAddr::from(0x8100_1000)),
            Err(AxError::InvalidInput)
        );
        assert_eq!(vcpu.regs.virtual_hs_csrs.hgatp, 0);
        vcpu.set_ept_root(HostPhysAddr::from(0x8100_0000)).unwrap();
        assert_eq!(vcpu.regs.virtual_hs_csrs.hgatp, 8 << 60 | 0x81000);
    }

    #[test]
    fn bind_loads_hgatp_and_vs_csrs() {
        let _guard = crate::test::serial();
        let mut vcpu = new_vcpu();
        vcpu.set_ept_root(HostPhysAddr::from(0x8100_0000)).unwrap();
        vcpu.regs.vs_csrs.vstvec = 0x8020_1000;
        vcpu.bind().unwrap();
        assert_eq!(CSR.hgatp.get_value(), 8 << 60 | 0x81000);
        assert_eq!(CSR.vstvec.get_value(), 0x8020_1000);

        // The guest moves its trap vector while running.
        CSR.vstvec.write_value(0x8020_2000);
        vcpu.unbind().unwrap();
        assert_eq!(vcpu.regs.vs_csrs.vstvec, 0x8020_2000);
    }

    #[test]
    fn virtual_interrupts_follow_the_vcpu() {
        let _guard = crate::test::serial();
        let vstip = traps::interrupt::VIRTUAL_SUPERVISOR_TIMER;
        let mut first = new_vcpu();
        let mut second = new_vcpu();
        CSR.hvip.write_value(0);

        first.bind().unwrap();
        // A host timer tick asserted VSTIP while `first` was running.
        CSR.hvip.read_and_set_bits(vstip);
        first.unbind().unwrap();
        assert_eq!(CSR.hvip.get_value(), 0);

        second.bind().unwrap();
        assert_eq!(CSR.hvip.get_value() & vstip, 0);
        second.unbind().unwrap();
        assert_eq!(second.pending_interrupts, 0);

        first.bind().unwrap();
        assert_eq!(CSR.hvip.get_value(), vstip);
        assert_eq!(first.pending_interrupts, 0);
    }

    #[test]
    #[cfg(not(target_arch = "riscv64"))]
    fn run_is_unsupported_off_riscv() {
        let mut vcpu = new_vcpu();
        assert_eq!(vcpu.run().unwrap_err(), AxError::Unsupported);
    }

    #[test]
    fn set_gpr_maps_to_argument_registers() {
        let mut vcpu = new_vcpu();
        vcpu.set_gpr(0, 0x10);
        vcpu.set_gpr(7, 0x17);
        vcpu.set_gpr(8, 0x18);
        assert_eq!(vcpu.get_gpr(GprIndex::A0), 0x10);
        assert_eq!(vcpu.get_gpr(GprIndex::A7), 0x17);
        assert_eq!(vcpu.get_gpr(GprIndex::S2), 0);

        vcpu.set_return_value(0x42);
        assert_eq!(vcpu.get_gpr(GprIndex::A0), 0x42);
    }

    #[test]
    fn hypercall_exit() {
        let mut vcpu = new_vcpu();
        match ecall(&mut vcpu, EID_HVC, 3, [1, 2, 3, 4, 5, 6]) {
            AxVCpuExitReason::Hypercall { nr, args } => {
                assert_eq!(nr, 3);
                assert_eq!(args, [1, 2, 3, 4, 5, 6]);
            }
            exit => panic!("unexpected exit {:?}", exit),
        }
        assert_eq!(pc(&vcpu), ENTRY + 4);
    }

    #[test]
    fn hart_start_and_stop() {
        let mut vcpu = new_vcpu();
        match ecall(&mut vcpu, hsm::EID_HSM, hsm::HART_START, [1, 0x8040_0000, 0x99, 0, 0, 0]) {
            AxVCpuExitReason::CpuUp {
                target_cpu,
                entry_point,
                arg,
            } => {
                assert_eq!(target_cpu, 1);
                assert_eq!(entry_point, GuestPhysAddr::from(0x8040_0000));
                assert_eq!(arg, 0x99);
            }
            exit => panic!("unexpected exit {:?}", exit),
        }
        assert_eq!(vcpu.get_gpr(GprIndex::A0), 0);
        assert_eq!(pc(&vcpu), ENTRY + 4);

        assert!(matches!(
            ecall(&mut vcpu, hsm::EID_HSM, hsm::HART_STOP, [0; 6]),
            AxVCpuExitReason::CpuDown { _state: 0 }
        ));
        assert_eq!(pc(&vcpu), ENTRY + 4);

        assert!(matches!(
            ecall(&mut vcpu, hsm::EID_HSM, hsm::HART_SUSPEND, [0; 6]),
            AxVCpuExitReason::Halt
        ));
    }

    #[test]
    fn hart_get_status_is_not_supported() {
        let mut vcpu = new_vcpu();
        assert!(matches!(
            ecall(&mut vcpu, hsm::EID_HSM, hsm::HART_GET_STATUS, [0; 6]),
            AxVCpuExitReason::Nothing
        ));
        assert_eq!(vcpu.get_gpr(GprIndex::A0), SbiRet::not_supported().error);
        assert_eq!(pc(&vcpu), ENTRY + 4);
    }

    #[test]
    fn shutdown_does_not_advance() {
        let mut vcpu = new_vcpu();
        assert!(matches!(
            ecall(&mut vcpu, legacy::LEGACY_SHUTDOWN, 0, [0; 6]),
            AxVCpuExitReason::SystemDown
        ));
        assert!(matches!(
            ecall(&mut vcpu, srst::EID_SRST, srst::SYSTEM_RESET, [0, 0, 0, 0, 0, 0]),
            AxVCpuExitReason::SystemDown
        ));
        assert_eq!(pc(&vcpu), ENTRY);
    }

    #[test]
    fn send_ipi_exit() {
        let mut vcpu = new_vcpu();
        match ecall(&mut vcpu, spi::EID_SPI, spi::SEND_IPI, [0b101, 4, 0, 0, 0, 0]) {
            AxVCpuExitReason::SendIPI {
                send_to_all,
                send_to_self,
                target_cpu,
                target_cpu_aux,
                vector,
            } => {
                assert!(!send_to_all);
                assert!(!send_to_self);
                assert_eq!(target_cpu, 4);
                assert_eq!(target_cpu_aux, 0b101);
                assert_eq!(vector, traps::irq::S_SOFT as u64);
            }
            exit => panic!("unexpected exit {:?}", exit),
        }

        assert!(matches!(
            ecall(&mut vcpu, spi::EID_SPI, spi::SEND_IPI, [0, usize::MAX, 0, 0, 0, 0]),
            AxVCpuExitReason::SendIPI {
                send_to_all: true,
                ..
            }
        ));
    }

    #[test]
    fn probe_reports_emulated_extensions() {
        let mut vcpu = new_vcpu();
        ecall(&mut vcpu, base::EID_BASE, base::PROBE_EXTENSION, [hsm::EID_HSM, 0, 0, 0, 0, 0]);
        assert_eq!(vcpu.get_gpr(GprIndex::A0), 0);
        assert_eq!(vcpu.get_gpr(GprIndex::A1), 1);
        assert_eq!(pc(&vcpu), ENTRY + 4);
    }

    #[test]
    fn set_timer_rearms_host_timer() {
        let _guard = crate::test::serial();
        let mut vcpu = new_vcpu();
        CSR.hvip.write_value(traps::interrupt::VIRTUAL_SUPERVISOR_TIMER);
        CSR.sie.write_value(0);

        ecall(&mut vcpu, time::EID_TIME, time::SET_TIMER, [0x1_0000, 0, 0, 0, 0, 0]);
        assert_eq!(CSR.hvip.get_value() & traps::interrupt::VIRTUAL_SUPERVISOR_TIMER, 0);
        assert_ne!(CSR.sie.get_value() & traps::interrupt::SUPERVISOR_TIMER, 0);
        assert_eq!(vcpu.get_gpr(GprIndex::A0), 0);

        ecall(&mut vcpu, legacy::LEGACY_SET_TIMER, 0, [0x2_0000, 0, 0, 0, 0, 0]);
        assert_eq!(vcpu.get_gpr(GprIndex::A0), 0);
        assert_eq!(pc(&vcpu), ENTRY + 8);
    }

    #[test]
    #[cfg(not(target_arch = "riscv64"))]
    fn console_without_firmware() {
        let mut vcpu = new_vcpu();
        ecall(&mut vcpu, legacy::LEGACY_CONSOLE_GETCHAR, 0, [0; 6]);
        assert_eq!(vcpu.get_gpr(GprIndex::A0) as isize, -1);

        // Legacy putchar only reports the error in `a0`.
        vcpu.set_gpr_from_gpr_index(GprIndex::A1, 0x77);
        ecall(&mut vcpu, legacy::LEGACY_CONSOLE_PUTCHAR, 0, [b'x' as usize, 0, 0, 0, 0, 0]);
        assert_eq!(vcpu.get_gpr(GprIndex::A0), SbiRet::not_supported().error);
        assert_eq!(vcpu.get_gpr(GprIndex::A1), 0x77);
        assert_eq!(pc(&vcpu), ENTRY + 8);
    }

    #[test]
    fn timer_interrupt_is_passed_to_guest() {
        let _guard = crate::test::serial();
        let mut vcpu = new_vcpu();
        CSR.hvip.write_value(0);
        CSR.sie.write_value(traps::interrupt::SUPERVISOR_TIMER);

        vcpu.regs.trap_csrs.scause = traps::irq::S_TIMER;
        assert!(matches!(vcpu.vmexit_handler(), Ok(AxVCpuExitReason::Nothing)));
        assert_ne!(CSR.hvip.get_value() & traps::interrupt::VIRTUAL_SUPERVISOR_TIMER, 0);
        assert_eq!(CSR.sie.get_value() & traps::interrupt::SUPERVISOR_TIMER, 0);
        assert_eq!(pc(&vcpu), ENTRY);
    }

    #[test]
    fn host_interrupts_exit() {
        let mut vcpu = new_vcpu();
        vcpu.regs.trap_csrs.scause = traps::irq::S_EXT;
        assert!(matches!(
            vcpu.vmexit_handler(),
            Ok(AxVCpuExitReason::ExternalInterrupt { vector: 33 })
        ));

        vcpu.regs.trap_csrs.scause = traps::irq::S_SOFT;
        match vcpu.vmexit_handler() {
            Ok(AxVCpuExitReason::ExternalInterrupt { vector }) => {
                assert_eq!(vector, traps::irq::S_SOFT as u64)
            }
            exit => panic!("unexpected exit {:?}", exit),
        }
    }

    #[test]
    fn mmio_store_from_htinst() {
        let mut vcpu = new_vcpu();
        vcpu.set_gpr_from_gpr_index(GprIndex::A5, 0xdead_beef_1234_5678);
        // Transformed `sw a5, 4(a0)`.
        match guest_page_fault(&mut vcpu, 23, 0x1000_0004, 0x00f0_2023) {
            AxVCpuExitReason::MmioWrite { addr, width, data } => {
                assert_eq!(addr, GuestPhysAddr::from(0x1000_0004));
                assert!(matches!(width, AccessWidth::Dword));
                assert_eq!(data, 0x1234_5678);
            }
            exit => panic!("unexpected exit {:?}", exit),
        }
        assert_eq!(pc(&vcpu), ENTRY + 4);
    }

    #[test]
    fn mmio_load_from_compressed_htinst() {
        let mut vcpu = new_vcpu();
        // Transformed `c.lw a0, 0(a1)`.
        match guest_page_fault(&mut vcpu, 21, 0x1000_0003, 0x0000_2501) {
            AxVCpuExitReason::MmioRead {
                addr,
                width,
                reg,
                reg_width,
                signed_ext,
            } => {
                assert_eq!(addr, GuestPhysAddr::from(0x1000_0003));
                assert!(matches!(width, AccessWidth::Dword));
                assert_eq!(reg, GprIndex::A0 as usize);
                assert!(matches!(reg_width, AccessWidth::Qword));
                assert!(signed_ext);
            }
            exit => panic!("unexpected exit {:?}", exit),
        }
        assert_eq!(pc(&vcpu), ENTRY + 2);
    }

    #[test]
    #[cfg(not(target_arch = "riscv64"))]
    fn undecodable_fault_is_nested_page_fault() {
        let mut vcpu = new_vcpu();
        match guest_page_fault(&mut vcpu, 21, 0x9000_1000, 0) {
            AxVCpuExitReason::NestedPageFault { addr, access_flags } => {
                assert_eq!(addr, GuestPhysAddr::from(0x9000_1000));
                assert_eq!(access_flags, MappingFlags::READ);
            }
            exit => panic!("unexpected exit {:?}", exit),
        }
        // A transformed load reported for a store fault is not trusted either.
        match guest_page_fault(&mut vcpu, 23, 0x9000_1000, 0x0000_2501) {
            AxVCpuExitReason::NestedPageFault { access_flags, .. } => {
                assert_eq!(access_flags, MappingFlags::WRITE);
            }
            exit => panic!("unexpected exit {:?}", exit),
        }
        assert_eq!(pc(&vcpu), ENTRY);

        match guest_page_fault(&mut vcpu, 20, 0x9000_2000, 0) {
            AxVCpuExitReason::NestedPageFault { access_flags, .. } => {
                assert_eq!(access_flags, MappingFlags::EXECUTE);
            }
            exit => panic!("unexpected exit {:?}", exit),
        }
    }

    #[test]
    fn wfi_halts() {
        let mut vcpu = new_vcpu();
        vcpu.regs.trap_csrs.scause = 22;
        vcpu.regs.trap_csrs.stval = INSN_WFI as usize;
        assert!(matches!(vcpu.vmexit_handler(), Ok(AxVCpuExitReason::Halt)));
        assert_eq!(pc(&vcpu), ENTRY + 4);

        // Any other virtual instruction is left unhandled.
        vcpu.regs.trap_csrs.stval = 0x1200_0073;
        assert_eq!(vcpu.vmexit_handler().unwrap_err(), AxError::Unsupported);
    }

    #[test]
    fn unhandled_exception_is_an_error() {
        let mut vcpu = new_vcpu();
        vcpu.regs.trap_csrs.scause = 2;
        assert_eq!(vcpu.vmexit_handler().unwrap_err(), AxError::Unsupported);
    }

    #[test]
    fn injected_interrupts_wait_for_entry() {
        let _guard = crate::test::serial();
        let mut vcpu = new_vcpu();
        CSR.hvip.write_value(0);

        vcpu.inject_interrupt(9).unwrap();
        vcpu.inject_interrupt(5).unwrap();
        assert_eq!(vcpu.inject_interrupt(3), Err(AxError::InvalidInput));
        assert_eq!(CSR.hvip.get_value(), 0);

        vcpu.clear_interrupt(5).unwrap();
        vcpu.flush_pending_interrupts();
        assert_eq!(
            CSR.hvip.get_value(),
            traps::interrupt::VIRTUAL_SUPERVISOR_EXTERNAL
        );
        assert_eq!(vcpu.pending_interrupts, 0);

        vcpu.clear_interrupt(10).unwrap();
        assert_eq!(CSR.hvip.get_value(), 0);
    }
}
