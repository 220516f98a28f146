use crate::consts::traps::irq::INTC_IRQ_BASE;

/// Interrupts that reach HS-mode while a guest is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interrupt {
    SupervisorSoft,
    SupervisorTimer,
    SupervisorExternal,
    Unknown(usize),
}

/// Exceptions that reach HS-mode while a guest is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    InstructionMisaligned,
    InstructionFault,
    IllegalInstruction,
    Breakpoint,
    LoadMisaligned,
    LoadFault,
    StoreMisaligned,
    StoreFault,
    UserEnvCall,
    VirtualSupervisorEnvCall,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
    InstructionGuestPageFault,
    LoadGuestPageFault,
    VirtualInstruction,
    StoreGuestPageFault,
    Unknown(usize),
}

/// The decoded value of `scause`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trap {
    Interrupt(Interrupt),
    Exception(Exception),
}

impl Trap {
    pub fn from_scause(scause: usize) -> Self {
        let code = scause & !INTC_IRQ_BASE;
        if scause & INTC_IRQ_BASE != 0 {
            Trap::Interrupt(match code {
                1 => Interrupt::SupervisorSoft,
                5 => Interrupt::SupervisorTimer,
                9 => Interrupt::SupervisorExternal,
                _ => Interrupt::Unknown(code),
            })
        } else {
            Trap::Exception(match code {
                0 => Exception::InstructionMisaligned,
                1 => Exception::InstructionFault,
                2 => Exception::IllegalInstruction,
                3 => Exception::Breakpoint,
                4 => Exception::LoadMisaligned,
                5 => Exception::LoadFault,
                6 => Exception::StoreMisaligned,
                7 => Exception::StoreFault,
                8 => Exception::UserEnvCall,
                10 => Exception::VirtualSupervisorEnvCall,
                12 => Exception::InstructionPageFault,
                13 => Exception::LoadPageFault,
                15 => Exception::StorePageFault,
                20 => Exception::InstructionGuestPageFault,
                21 => Exception::LoadGuestPageFault,
                22 => Exception::VirtualInstruction,
                23 => Exception::StoreGuestPageFault,
                _ => Exception::Unknown(code),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::traps::irq;

    #[test]
    fn interrupt_bit_selects_interrupts() {
        assert_eq!(
            Trap::from_scause(irq::S_TIMER),
            Trap::Interrupt(Interrupt::SupervisorTimer)
        );
        assert_eq!(
            Trap::from_scause(irq::S_EXT),
            Trap::Interrupt(Interrupt::SupervisorExternal)
        );
        assert_eq!(
            Trap::from_scause(irq::S_SOFT),
            Trap::Interrupt(Interrupt::SupervisorSoft)
        );
        assert_eq!(
            Trap::from_scause(INTC_IRQ_BASE + 6),
            Trap::Interrupt(Interrupt::Unknown(6))
        );
    }

    #[test]
    fn hypervisor_exceptions() {
        assert_eq!(
            Trap::from_scause(10),
            Trap::Exception(Exception::VirtualSupervisorEnvCall)
        );
        assert_eq!(
            Trap::from_scause(21),
            Trap::Exception(Exception::LoadGuestPageFault)
        );
        assert_eq!(
            Trap::from_scause(23),
            Trap::Exception(Exception::StoreGuestPageFault)
        );
        assert_eq!(
            Trap::from_scause(22),
            Trap::Exception(Exception::VirtualInstruction)
        );
        assert_eq!(Trap::from_scause(9), Trap::Exception(Exception::Unknown(9)));
    }
}
