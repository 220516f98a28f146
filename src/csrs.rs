pub use defs::*;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::RegisterLongName;

/// Define each registers of hypervisor using.
pub struct CSR {
    /// The `sstatus` csr.
    pub sstatus: ReadWriteCsr<(), CSR_SSTATUS>,
    /// The `sie` csr.
    pub sie: ReadWriteCsr<sie::Register, CSR_SIE>,
    /// The `scause` csr.
    pub scause: ReadWriteCsr<(), CSR_SCAUSE>,
    /// The `stval` csr.
    pub stval: ReadWriteCsr<(), CSR_STVAL>,
    /// The `hstatus` csr.
    pub hstatus: ReadWriteCsr<hstatus::Register, CSR_HSTATUS>,
    /// The `hedeleg` csr.
    pub hedeleg: ReadWriteCsr<hedeleg::Register, CSR_HEDELEG>,
    /// The `hideleg` csr.
    pub hideleg: ReadWriteCsr<hideleg::Register, CSR_HIDELEG>,
    /// The `hie` csr.
    pub hie: ReadWriteCsr<hie::Register, CSR_HIE>,
    /// The `hcounteren` csr.
    pub hcounteren: ReadWriteCsr<hcounteren::Register, CSR_HCOUNTEREN>,
    /// The `hvip` csr.
    pub hvip: ReadWriteCsr<hvip::Register, CSR_HVIP>,
    /// The `htval` csr.
    pub htval: ReadWriteCsr<(), CSR_HTVAL>,
    /// The `htinst` csr.
    pub htinst: ReadWriteCsr<(), CSR_HTINST>,
    /// The `hgatp` csr.
    pub hgatp: ReadWriteCsr<(), CSR_HGATP>,
    /// The `htimedelta` csr.
    pub htimedelta: ReadWriteCsr<(), CSR_HTIMEDELTA>,
    /// The `vsstatus` csr.
    pub vsstatus: ReadWriteCsr<(), CSR_VSSTATUS>,
    /// The `vsie` csr.
    pub vsie: ReadWriteCsr<(), CSR_VSIE>,
    /// The `vstvec` csr.
    pub vstvec: ReadWriteCsr<(), CSR_VSTVEC>,
    /// The `vsscratch` csr.
    pub vsscratch: ReadWriteCsr<(), CSR_VSSCRATCH>,
    /// The `vsepc` csr.
    pub vsepc: ReadWriteCsr<(), CSR_VSEPC>,
    /// The `vscause` csr.
    pub vscause: ReadWriteCsr<(), CSR_VSCAUSE>,
    /// The `vstval` csr.
    pub vstval: ReadWriteCsr<(), CSR_VSTVAL>,
    /// The `vsatp` csr.
    pub vsatp: ReadWriteCsr<(), CSR_VSATP>,
}

#[allow(clippy::identity_op, clippy::erasing_op)]
pub const CSR: &CSR = &CSR {
    sstatus: ReadWriteCsr::new(),
    sie: ReadWriteCsr::new(),
    scause: ReadWriteCsr::new(),
    stval: ReadWriteCsr::new(),
    hstatus: ReadWriteCsr::new(),
    hedeleg: ReadWriteCsr::new(),
    hideleg: ReadWriteCsr::new(),
    hie: ReadWriteCsr::new(),
    hcounteren: ReadWriteCsr::new(),
    hvip: ReadWriteCsr::new(),
    htval: ReadWriteCsr::new(),
    htinst: ReadWriteCsr::new(),
    hgatp: ReadWriteCsr::new(),
    htimedelta: ReadWriteCsr::new(),
    vsstatus: ReadWriteCsr::new(),
    vsie: ReadWriteCsr::new(),
    vstvec: ReadWriteCsr::new(),
    vsscratch: ReadWriteCsr::new(),
    vsepc: ReadWriteCsr::new(),
    vscause: ReadWriteCsr::new(),
    vstval: ReadWriteCsr::new(),
    vsatp: ReadWriteCsr::new(),
};

/// Trait defining the possible operations on a RISC-V CSR.
pub trait RiscvCsrTrait {
    /// The bitfield layout of the CSR.
    type R: RegisterLongName;
    /// Reads the value of the CSR.
    fn get_value(&self) -> usize;

    /// Writes the value of the CSR.
    fn write_value(&self, value: usize);

    /// Atomically swaps the value of the CSR, returning the old value.
    fn atomic_replace(&self, value: usize) -> usize;

    /// Atomically read a CSR and set bits specified in a bitmask
    fn read_and_set_bits(&self, bitmasks: usize) -> usize;

    /// Atomically read a CSR and clear bits specified in a bitmask
    fn read_and_clear_bits(&self, bitmasks: usize) -> usize;
}

/// Read/Write register.
pub struct ReadWriteCsr<R: RegisterLongName, const V: u16> {
    associated_register: core::marker::PhantomData<R>,
}

impl<R: RegisterLongName, const V: u16> ReadWriteCsr<R, V> {
    /// Create a new instance of the CSR.
    pub const fn new() -> Self {
        Self {
            associated_register: core::marker::PhantomData,
        }
    }

    /// The CSR number.
    pub const fn number(&self) -> u16 {
        V
    }
}

impl<R: RegisterLongName, const V: u16> Default for ReadWriteCsr<R, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RegisterLongName, const V: u16> RiscvCsrTrait for ReadWriteCsr<R, V> {
    type R = R;

    fn get_value(&self) -> usize {
        raw::read::<V>()
    }

    fn write_value(&self, value: usize) {
        raw::write::<V>(value)
    }

    fn atomic_replace(&self, value: usize) -> usize {
        raw::swap::<V>(value)
    }

    fn read_and_set_bits(&self, bitmask: usize) -> usize {
        raw::set_bits::<V>(bitmask)
    }

    fn read_and_clear_bits(&self, bitmask: usize) -> usize {
        raw::clear_bits::<V>(bitmask)
    }
}

// The Readable and Writeable traits aren't object-safe so unfortunately we can't implement them
// for RiscvCsrInterface.
impl<R: RegisterLongName, const V: u16> Readable for ReadWriteCsr<R, V> {
    type T = usize;
    type R = R;

    fn get(&self) -> usize {
        self.get_value()
    }
}

impl<R: RegisterLongName, const V: u16> Writeable for ReadWriteCsr<R, V> {
    type T = usize;
    type R = R;

    fn set(&self, val_to_set: usize) {
        self.write_value(val_to_set);
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        /// CSR instructions, with the CSR number encoded as an immediate.
        mod raw {
            use core::arch::asm;

            #[inline(always)]
            pub fn read<const V: u16>() -> usize {
                let r: usize;
                unsafe { asm!("csrr {rd}, {csr}", rd = out(reg) r, csr = const V) };
                r
            }

            #[inline(always)]
            pub fn write<const V: u16>(value: usize) {
                unsafe { asm!("csrw {csr}, {rs}", csr = const V, rs = in(reg) value) };
            }

            #[inline(always)]
            pub fn swap<const V: u16>(value: usize) -> usize {
                let r: usize;
                unsafe {
                    asm!("csrrw {rd}, {csr}, {rs}", rd = out(reg) r, csr = const V, rs = in(reg) value)
                };
                r
            }

            #[inline(always)]
            pub fn set_bits<const V: u16>(bitmask: usize) -> usize {
                let r: usize;
                unsafe {
                    asm!("csrrs {rd}, {csr}, {rs}", rd = out(reg) r, csr = const V, rs = in(reg) bitmask)
                };
                r
            }

            #[inline(always)]
            pub fn clear_bits<const V: u16>(bitmask: usize) -> usize {
                let r: usize;
                unsafe {
                    asm!("csrrc {rd}, {csr}, {rs}", rd = out(reg) r, csr = const V, rs = in(reg) bitmask)
                };
                r
            }
        }
    } else {
        /// An in-memory CSR file standing in for the hart's CSRs on non-RISC-V hosts.
        mod raw {
            use core::sync::atomic::{AtomicUsize, Ordering};

            const CSR_COUNT: usize = 4096;

            #[allow(clippy::declare_interior_mutable_const)]
            const ZERO: AtomicUsize = AtomicUsize::new(0);
            static BANK: [AtomicUsize; CSR_COUNT] = [ZERO; CSR_COUNT];

            fn csr<const V: u16>() -> &'static AtomicUsize {
                &BANK[V as usize % CSR_COUNT]
            }

            pub fn read<const V: u16>() -> usize {
                csr::<V>().load(Ordering::SeqCst)
            }

            pub fn write<const V: u16>(value: usize) {
                csr::<V>().store(value, Ordering::SeqCst)
            }

            pub fn swap<const V: u16>(value: usize) -> usize {
                csr::<V>().swap(value, Ordering::SeqCst)
            }

            pub fn set_bits<const V: u16>(bitmask: usize) -> usize {
                csr::<V>().fetch_or(bitmask, Ordering::SeqCst)
            }

            pub fn clear_bits<const V: u16>(bitmask: usize) -> usize {
                csr::<V>().fetch_and(!bitmask, Ordering::SeqCst)
            }
        }
    }
}

/// Definitions
pub mod defs {
    use tock_registers::register_bitfields;
    pub const CSR_SSTATUS: u16 = 0x100;
    pub const CSR_SEDELEG: u16 = 0x102;
    pub const CSR_SIDELEG: u16 = 0x103;
    pub const CSR_SIE: u16 = 0x104;
    pub const CSR_STVEC: u16 = 0x105;
    pub const CSR_SCOUNTEREN: u16 = 0x106;
    pub const CSR_SENVCFG: u16 = 0x10a;
    pub const CSR_SSCRATCH: u16 = 0x140;
    pub const CSR_SEPC: u16 = 0x141;
    pub const CSR_SCAUSE: u16 = 0x142;
    pub const CSR_STVAL: u16 = 0x143;
    pub const CSR_SIP: u16 = 0x144;
    pub const CSR_STIMECMP: u16 = 0x14d;
    pub const CSR_SISELECT: u16 = 0x150;
    pub const CSR_SIREG: u16 = 0x151;
    pub const CSR_STOPEI: u16 = 0x15c;
    pub const CSR_SATP: u16 = 0x180;
    pub const CSR_STOPI: u16 = 0xdb0;
    pub const CSR_SCONTEXT: u16 = 0x5a8;
    pub const CSR_VSSTATUS: u16 = 0x200;
    pub const CSR_VSIE: u16 = 0x204;
    pub const CSR_VSTVEC: u16 = 0x205;
    pub const CSR_VSSCRATCH: u16 = 0x240;
    pub const CSR_VSEPC: u16 = 0x241;
    pub const CSR_VSCAUSE: u16 = 0x242;
    pub const CSR_VSTVAL: u16 = 0x243;
    pub const CSR_VSIP: u16 = 0x244;
    pub const CSR_VSTIMECMP: u16 = 0x24d;
    pub const CSR_VSISELECT: u16 = 0x250;
    pub const CSR_VSIREG: u16 = 0x251;
    pub const CSR_VSTOPEI: u16 = 0x25c;
    pub const CSR_VSATP: u16 = 0x280;
    pub const CSR_VSTOPI: u16 = 0xeb0;
    pub const CSR_HSTATUS: u16 = 0x600;
    pub const CSR_HEDELEG: u16 = 0x602;
    pub const CSR_HIDELEG: u16 = 0x603;
    pub const CSR_HIE: u16 = 0x604;
    pub const CSR_HTIMEDELTA: u16 = 0x605;
    pub const CSR_HCOUNTEREN: u16 = 0x606;
    pub const CSR_HGEIE: u16 = 0x607;
    pub const CSR_HVICTL: u16 = 0x609;
    pub const CSR_HENVCFG: u16 = 0x60a;
    pub const CSR_HTVAL: u16 = 0x643;
    pub const CSR_HIP: u16 = 0x644;
    pub const CSR_HVIP: u16 = 0x645;
    pub const CSR_HTINST: u16 = 0x64a;
    pub const CSR_HGATP: u16 = 0x680;
    pub const CSR_HCONTEXT: u16 = 0x6a8;
    pub const CSR_HGEIP: u16 = 0xe12;

    // Hypervisor exception delegation register.
    register_bitfields![usize,
    /// Hypervisor exception delegation register.
    pub hedeleg [
        /// Instruction address misaligned.
        instr_misaligned OFFSET(0) NUMBITS(1) [],
        /// Instruction access fault.
        instr_fault OFFSET(1) NUMBITS(1) [],
        /// Illegal instruction.
        illegal_instr OFFSET(2) NUMBITS(1) [],
        /// Breakpoint.
        breakpoint OFFSET(3) NUMBITS(1) [],
        /// Load address misaligned.
        load_misaligned OFFSET(4) NUMBITS(1) [],
        /// Load access fault.
        load_fault OFFSET(5) NUMBITS(1) [],
        /// Store address misaligned.
        store_misaligned OFFSET(6) NUMBITS(1) [],
        /// Store access fault.
        store_fault OFFSET(7) NUMBITS(1) [],
        /// User environment call.
        u_ecall OFFSET(8) NUMBITS(1) [],
        /// Instruction page fault.
        instr_page_fault OFFSET(12) NUMBITS(1) [],
        /// Load page fault.
        load_page_fault OFFSET(13) NUMBITS(1) [],
        /// Store page fault.
        store_page_fault OFFSET(15) NUMBITS(1) [],
    ]
    ];

    // Supervisor interrupt enable register.
    register_bitfields![usize,
    /// Supervisor interrupt enable register.
    pub sie [
        /// Supervisor software interrupt.
        ssoft OFFSET(1) NUMBITS(1) [],
        /// Supervisor timer interrupt.
        stimer OFFSET(5) NUMBITS(1) [],
        /// Supervisor external interrupt.
        sext OFFSET(9) NUMBITS(1) [],
    ]
    ];

    // Hypervisor status register.
    register_bitfields![usize,
    /// Hypervisor status register.
    pub hstatus [
        /// VS mode endianness control.
        vsbe OFFSET(5) NUMBITS(1) [],
        /// A guest virtual address was written to stval as a result of the trap.
        gva OFFSET(6) NUMBITS(1) [],
        /// Virtualization mode at time of trap.
        spv OFFSET(7) NUMBITS(1) [
            /// User mode.
            User = 0,
            /// Supervisor mode.
            Supervisor = 1,
        ],
        /// Privilege level the virtual hart was executing before entering HS-mode.
        spvp OFFSET(8) NUMBITS(1) [
            /// User mode.
            User = 0,
            /// Supervisor mode.
            Supervisor = 1,
        ],
        /// Allow hypervisor instructions in U-mode.
        hu OFFSET(9) NUMBITS(1) [],
        /// Selects the guest external interrupt source for VS external interrupts.
        vgein OFFSET(12) NUMBITS(6) [],
        /// Trap on SFENCE, SINVAL, or changes to vsatp.
        vtvm OFFSET(20) NUMBITS(1) [],
        /// Trap on WFI timeout.
        vtw OFFSET(21) NUMBITS(1) [],
        /// Trap SRET instruction.
        vtsr OFFSET(22) NUMBITS(1) [],
        /// Native base integer ISA width for VS-mode.
        vsxl OFFSET(32) NUMBITS(2) [
            /// 32-bit.
            Xlen32 = 1,
            /// 64-bit.
            Xlen64 = 2,
        ],
    ]
    ];

    // Hypervisor interrupt delegation register.
    register_bitfields![usize,
    /// Hypervisor interrupt delegation register.
    pub hideleg [
        /// VS-mode software interrupt.
        vssoft OFFSET(2) NUMBITS(1) [],
        /// VS-mode timer interrupt.
        vstimer OFFSET(6) NUMBITS(1) [],
        /// VS-mode external interrupt.
        vsext OFFSET(10) NUMBITS(1) [],
    ]
    ];

    // Hypervisor interrupt enable register.
    register_bitfields![usize,
    /// Hypervisor interrupt enable register.
    pub hie [
        /// VS-mode software interrupt.
        vssoft OFFSET(2) NUMBITS(1) [],
        /// VS-mode timer interrupt.
        vstimer OFFSET(6) NUMBITS(1) [],
        /// VS-mode external interrupt.
        vsext OFFSET(10) NUMBITS(1) [],
        /// Supervisor guest external interrupt.
        sgext OFFSET(12) NUMBITS(1) [],
    ]
    ];

    // VS-mode counter availability control.
    register_bitfields![usize,
    /// Hypervisor counter enable register.
    pub hcounteren [
        /// Cycle.
        cycle OFFSET(0) NUMBITS(1) [],
        /// Time.
        time OFFSET(1) NUMBITS(1) [],
        /// Instret.
        instret OFFSET(2) NUMBITS(1) [],
        /// HPM.
        hpm OFFSET(3) NUMBITS(29) [],
    ]
    ];

    // Hypervisor virtual interrupt pending.
    register_bitfields![usize,
    /// Hypervisor virtual interrupt pending.
    pub hvip [
        /// VS-mode software interrupt.
        vssoft OFFSET(2) NUMBITS(1) [],
        /// VS-mode timer interrupt.
        vstimer OFFSET(6) NUMBITS(1) [],
        /// VS-mode external interrupt.
        vsext OFFSET(10) NUMBITS(1) [],
    ]
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use tock_registers::interfaces::ReadWriteable;

    #[test]
    fn set_and_clear_bits_return_previous_value() {
        let _guard = crate::test::serial();
        let csr = &CSR.hie;
        csr.write_value(0);
        assert_eq!(csr.read_and_set_bits(1 << 6), 0);
        assert_eq!(csr.read_and_set_bits(1 << 10), 1 << 6);
        assert_eq!(csr.read_and_clear_bits(1 << 6), (1 << 6) | (1 << 10));
        assert_eq!(csr.get_value(), 1 << 10);
        assert_eq!(csr.atomic_replace(0), 1 << 10);
        assert_eq!(csr.get_value(), 0);
    }

    #[test]
    fn bitfields_through_tock_registers() {
        let _guard = crate::test::serial();
        let counteren = &CSR.hcounteren;
        counteren.write(hcounteren::cycle::SET + hcounteren::time::SET);
        assert!(counteren.is_set(hcounteren::time));
        assert!(!counteren.is_set(hcounteren::instret));
        counteren.modify(hcounteren::time::CLEAR + hcounteren::instret::SET);
        assert_eq!(counteren.get(), 0b101);
        assert_eq!(counteren.number(), CSR_HCOUNTEREN);
    }
}
