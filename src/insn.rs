//! Decoding of the guest loads and stores that fault on emulated MMIO regions.

use axaddrspace::device::AccessWidth;

use crate::regs::GprIndex;

/// `wfi`, reported as a virtual instruction exception when `hstatus.VTW` is set.
pub const INSN_WFI: u32 = 0x1050_0073;

const OPCODE_LOAD: u32 = 0b000_0011;
const OPCODE_STORE: u32 = 0b010_0011;

/// Direction of an emulated access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmioKind {
    /// A load. `signed` is set when the value must be sign-extended into the register.
    Load { signed: bool },
    /// A store.
    Store,
}

/// A decoded load or store.
#[derive(Clone, Copy, Debug)]
pub struct MmioInstruction {
    pub kind: MmioKind,
    pub width: AccessWidth,
    /// Destination register of a load, source register of a store.
    pub reg: GprIndex,
    /// Length of the original instruction in bytes, 2 or 4.
    pub len: usize,
}

/// Length in bytes of the instruction whose lowest 16 bits are `low`.
pub fn insn_len(low: u16) -> usize {
    if low & 0b11 == 0b11 {
        4
    } else {
        2
    }
}

/// Bit mask covering an access of `width`.
pub fn width_mask(width: AccessWidth) -> u64 {
    match width {
        AccessWidth::Byte => 0xff,
        AccessWidth::Word => 0xffff,
        AccessWidth::Dword => 0xffff_ffff,
        AccessWidth::Qword => u64::MAX,
    }
}

impl MmioInstruction {
    /// Decodes a raw instruction; 16-bit encodings occupy the low half of `insn`.
    pub fn decode(insn: u32) -> Option<Self> {
        if insn_len(insn as u16) == 4 {
            decode_standard(insn)
        } else {
            decode_compressed(insn as u16)
        }
    }

    /// Decodes the transformed instruction the hart writes to `htinst` on a guest page fault.
    ///
    /// Returns `None` when `htinst` carries no transformed load/store (zero, or a
    /// pseudoinstruction for an implicit access), in which case the instruction has to be
    /// fetched from guest memory.
    pub fn from_htinst(htinst: usize) -> Option<Self> {
        let htinst = htinst as u32;
        if htinst & 0b1 == 0 {
            return None;
        }
        // Bit 1 clear: the trapping instruction was a compressed one.
        let len = if htinst & 0b10 != 0 { 4 } else { 2 };
        decode_standard(htinst | 0b11).map(|insn| Self { len, ..insn })
    }
}

//  31          25 24   20 19   15 14  12 11          7 6      0
// ┌──────────────┬───────┬───────┬──────┬─────────────┬────────┐
// │  imm[11:5]   │  rs2  │  rs1  │funct3│ rd/imm[4:0] │ opcode │
// └──────────────┴───────┴───────┴──────┴─────────────┴────────┘
fn decode_standard(insn: u32) -> Option<MmioInstruction> {
    let opcode = insn & 0x7f;
    let funct3 = (insn >> 12) & 0x7;
    let rd = (insn >> 7) & 0x1f;
    let rs2 = (insn >> 20) & 0x1f;

    let (kind, width, reg) = match opcode {
        OPCODE_LOAD => {
            let (width, signed) = match funct3 {
                0b000 => (AccessWidth::Byte, true),
                0b001 => (AccessWidth::Word, true),
                0b010 => (AccessWidth::Dword, true),
                0b011 => (AccessWidth::Qword, false),
                0b100 => (AccessWidth::Byte, false),
                0b101 => (AccessWidth::Word, false),
                0b110 => (AccessWidth::Dword, false),
                _ => return None,
            };
            (MmioKind::Load { signed }, width, rd)
        }
        OPCODE_STORE => {
            let width = match funct3 {
                0b000 => AccessWidth::Byte,
                0b001 => AccessWidth::Word,
                0b010 => AccessWidth::Dword,
                0b011 => AccessWidth::Qword,
                _ => return None,
            };
            (MmioKind::Store, width, rs2)
        }
        _ => return None,
    };

    Some(MmioInstruction {
        kind,
        width,
        reg: GprIndex::from_raw(reg)?,
        len: 4,
    })
}

// Quadrant 0 uses the 3-bit register fields (x8-x15), quadrant 2 the stack-pointer
// relative forms with full 5-bit register fields.
fn decode_compressed(insn: u16) -> Option<MmioInstruction> {
    let insn = insn as u32;
    let quadrant = insn & 0b11;
    let funct3 = (insn >> 13) & 0x7;
    let reg_prime = ((insn >> 2) & 0x7) + 8;

    let (kind, width, reg) = match (quadrant, funct3) {
        // C.LW / C.LD
        (0b00, 0b010) => (MmioKind::Load { signed: true }, AccessWidth::Dword, reg_prime),
        (0b00, 0b011) => (MmioKind::Load { signed: false }, AccessWidth::Qword, reg_prime),
        // C.SW / C.SD
        (0b00, 0b110) => (MmioKind::Store, AccessWidth::Dword, reg_prime),
        (0b00, 0b111) => (MmioKind::Store, AccessWidth::Qword, reg_prime),
        // C.LWSP / C.LDSP
        (0b10, 0b010) => (
            MmioKind::Load { signed: true },
            AccessWidth::Dword,
            (insn >> 7) & 0x1f,
        ),
        (0b10, 0b011) => (
            MmioKind::Load { signed: false },
            AccessWidth::Qword,
            (insn >> 7) & 0x1f,
        ),
        // C.SWSP / C.SDSP
        (0b10, 0b110) => (MmioKind::Store, AccessWidth::Dword, (insn >> 2) & 0x1f),
        (0b10, 0b111) => (MmioKind::Store, AccessWidth::Qword, (insn >> 2) & 0x1f),
        _ => return None,
    };

    Some(MmioInstruction {
        kind,
        width,
        reg: GprIndex::from_raw(reg)?,
        len: 2,
    })
}
