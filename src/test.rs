#![cfg(test)]

use std::sync::{Mutex, MutexGuard};

static SERIAL: Mutex<()> = Mutex::new(());

/// Serializes tests sharing global state: the host CSR bank and the current vcpu pointer.
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

mod tests {
    use super::serial;
    use crate::{
        clear_current_vcpu, get_current_vcpu, AxArchPerCpu, AxArchVCpu, AxPerCpu, AxVCpu,
        AxVCpuExitReason, VCpuId, VCpuState, VMId,
    };
    use alloc::{
        rc::Rc,
        string::{String, ToString},
        vec::Vec,
    };
    use axaddrspace::{GuestPhysAddr, HostPhysAddr};
    use axerrno::{AxError, AxResult};
    use core::cell::RefCell;

    type CallLog = Rc<RefCell<Vec<String>>>;

    // Records the calls made by `AxVCpu` and enforces the expected ordering.
    #[derive(Debug)]
    struct MockArchVCpu {
        vm_id: VMId,
        vcpu_id: VCpuId,
        entry: Option<GuestPhysAddr>,
        ept_root: Option<HostPhysAddr>,
        is_setup: bool,
        is_bound: bool,
        args: [usize; 8],
        return_value: usize,
        call_log: CallLog,
    }

    #[derive(Debug, Clone)]
    struct MockCreateConfig {
        call_log: CallLog,
        fail: bool,
    }

    impl MockArchVCpu {
        fn log(&self, call: impl Into<String>) {
            self.call_log.borrow_mut().push(call.into());
        }
    }

    impl AxArchVCpu for MockArchVCpu {
        type CreateConfig = MockCreateConfig;
        type SetupConfig = ();

        fn new(vm_id: VMId, vcpu_id: VCpuId, config: Self::CreateConfig) -> AxResult<Self> {
            if config.fail {
                return Err(AxError::NoMemory);
            }
            config.call_log.borrow_mut().push("new".to_string());
            Ok(Self {
                vm_id,
                vcpu_id,
                entry: None,
                ept_root: None,
                is_setup: false,
                is_bound: false,
                args: [0; 8],
                return_value: 0,
                call_log: config.call_log,
            })
        }

        fn set_entry(&mut self, entry: GuestPhysAddr) -> AxResult {
            self.log("set_entry");
            self.entry = Some(entry);
            Ok(())
        }

        fn set_ept_root(&mut self, ept_root: HostPhysAddr) -> AxResult {
            self.log("set_ept_root");
            self.ept_root = Some(ept_root);
            Ok(())
        }

        fn setup(&mut self, _config: Self::SetupConfig) -> AxResult {
            self.log("setup");
            if self.entry.is_none() || self.ept_root.is_none() {
                return Err(AxError::InvalidInput);
            }
            self.is_setup = true;
            Ok(())
        }

        fn run(&mut self) -> AxResult<AxVCpuExitReason> {
            self.log("run");
            if !self.is_bound {
                return Err(AxError::BadState);
            }
            // `AxVCpu` publishes itself while the guest runs.
            let current = get_current_vcpu::<Self>().ok_or(AxError::BadState)?;
            assert_eq!(current.id(), self.vcpu_id);
            assert_eq!(current.vm_id(), self.vm_id);
            Ok(AxVCpuExitReason::Halt)
        }

        fn bind(&mut self) -> AxResult {
            self.log("bind");
            if !self.is_setup {
                return Err(AxError::BadState);
            }
            self.is_bound = true;
            Ok(())
        }

        fn unbind(&mut self) -> AxResult {
            self.log("unbind");
            self.is_bound = false;
            Ok(())
        }

        fn set_gpr(&mut self, reg: usize, val: usize) {
            self.log(format!("set_gpr({}, {:#x})", reg, val));
            if let Some(slot) = self.args.get_mut(reg) {
                *slot = val;
            }
        }

        fn inject_interrupt(&mut self, vector: usize) -> AxResult {
            self.log(format!("inject_interrupt({})", vector));
            Ok(())
        }

        fn set_return_value(&mut self, val: usize) {
            self.return_value = val;
        }
    }

    fn create_mock_vcpu(id: VCpuId) -> (AxVCpu<MockArchVCpu>, CallLog) {
        let call_log = Rc::new(RefCell::new(Vec::new()));
        let config = MockCreateConfig {
            call_log: call_log.clone(),
            fail: false,
        };
        let vcpu = AxVCpu::new(1, id, 0, None, config).unwrap();
        (vcpu, call_log)
    }

    fn entry() -> GuestPhysAddr {
        GuestPhysAddr::from(0x8020_0000)
    }

    fn ept_root() -> HostPhysAddr {
        HostPhysAddr::from(0x8100_0000)
    }

    #[test]
    fn test_vcpu_creation() {
        let (vcpu, call_log) = create_mock_vcpu(0);

        assert_eq!(vcpu.vm_id(), 1);
        assert_eq!(vcpu.id(), 0);
        assert_eq!(vcpu.favor_phys_cpu(), 0);
        assert_eq!(vcpu.phys_cpu_set(), None);
        assert_eq!(vcpu.state(), VCpuState::Created);
        assert!(vcpu.is_bsp());
        assert_eq!(*call_log.borrow(), ["new"]);
    }

    #[test]
    fn test_vcpu_creation_failure() {
        let config = MockCreateConfig {
            call_log: Rc::new(RefCell::new(Vec::new())),
            fail: true,
        };
        let result = AxVCpu::<MockArchVCpu>::new(1, 0, 0, None, config);
        assert!(matches!(result, Err(AxError::NoMemory)));
    }

    #[test]
    fn test_vcpu_full_lifecycle() {
        let _guard = serial();
        let (vcpu, call_log) = create_mock_vcpu(0);

        vcpu.setup(entry(), ept_root(), ()).unwrap();
        assert_eq!(vcpu.state(), VCpuState::Free);
        assert_eq!(vcpu.get_arch_vcpu().entry, Some(entry()));
        assert_eq!(vcpu.get_arch_vcpu().ept_root, Some(ept_root()));

        vcpu.bind().unwrap();
        assert_eq!(vcpu.state(), VCpuState::Ready);

        assert!(matches!(vcpu.run(), Ok(AxVCpuExitReason::Halt)));
        assert_eq!(vcpu.state(), VCpuState::Ready);
        assert!(get_current_vcpu::<MockArchVCpu>().is_none());

        vcpu.unbind().unwrap();
        assert_eq!(vcpu.state(), VCpuState::Free);

        assert_eq!(
            *call_log.borrow(),
            ["new", "set_entry", "set_ept_root", "setup", "bind", "run", "unbind"]
        );
    }

    #[test]
    fn test_vcpu_run_requires_ready() {
        let _guard = serial();
        let (vcpu, call_log) = create_mock_vcpu(0);
        vcpu.setup(entry(), ept_root(), ()).unwrap();

        // Not bound yet: the vcpu is still `Free`.
        assert_eq!(vcpu.run().unwrap_err(), AxError::BadState);
        assert_eq!(vcpu.state(), VCpuState::Invalid);
        assert!(!call_log.borrow().contains(&"run".to_string()));
    }

    #[test]
    fn test_vcpu_failed_operation_invalidates_state() {
        let _guard = serial();
        let (vcpu, _) = create_mock_vcpu(0);

        // Binding before setup fails inside the architecture layer.
        vcpu.transition_state(VCpuState::Created, VCpuState::Free)
            .unwrap();
        assert_eq!(vcpu.bind().unwrap_err(), AxError::BadState);
        assert_eq!(vcpu.state(), VCpuState::Invalid);
    }

    #[test]
    fn test_vcpu_state_transitions() {
        let (vcpu, _) = create_mock_vcpu(0);

        vcpu.transition_state(VCpuState::Created, VCpuState::Free)
            .unwrap();
        assert_eq!(vcpu.state(), VCpuState::Free);
        vcpu.transition_state(VCpuState::Free, VCpuState::Ready)
            .unwrap();
        assert_eq!(vcpu.state(), VCpuState::Ready);

        assert!(vcpu
            .transition_state(VCpuState::Running, VCpuState::Free)
            .is_err());
        assert_eq!(vcpu.state(), VCpuState::Invalid);

        unsafe { vcpu.set_state(VCpuState::Blocked) };
        assert_eq!(vcpu.state(), VCpuState::Blocked);
    }

    #[test]
    fn test_vcpu_register_operations() {
        let (vcpu, call_log) = create_mock_vcpu(0);

        vcpu.set_gpr(1, 0xdead_beef);
        vcpu.set_return_value(42);
        vcpu.inject_interrupt(5).unwrap();

        let arch = vcpu.get_arch_vcpu();
        assert_eq!(arch.args[1], 0xdead_beef);
        assert_eq!(arch.return_value, 42);
        let calls = call_log.borrow();
        assert!(calls.contains(&"set_gpr(1, 0xdeadbeef)".to_string()));
        assert!(calls.contains(&"inject_interrupt(5)".to_string()));
    }

    #[test]
    fn test_vcpu_bsp_and_affinity() {
        let call_log = Rc::new(RefCell::new(Vec::new()));
        let config = MockCreateConfig {
            call_log,
            fail: false,
        };

        let vcpu0 = AxVCpu::<MockArchVCpu>::new(1, 0, 0, None, config.clone()).unwrap();
        let vcpu1 = AxVCpu::<MockArchVCpu>::new(1, 1, 2, Some(0b1010), config).unwrap();

        assert!(vcpu0.is_bsp());
        assert!(!vcpu1.is_bsp());
        assert_eq!(vcpu1.favor_phys_cpu(), 2);
        assert_eq!(vcpu1.phys_cpu_set(), Some(0b1010));
    }

    // Withdraws the current vcpu when a test unwinds out of `with_current_cpu_set`.
    struct ClearCurrentOnDrop;

    impl Drop for ClearCurrentOnDrop {
        fn drop(&mut self) {
            unsafe { clear_current_vcpu::<MockArchVCpu>() };
        }
    }

    #[test]
    #[should_panic(expected = "nested vcpu operation")]
    fn test_nested_current_vcpu_panics() {
        let _guard = serial();
        let _reset = ClearCurrentOnDrop;
        let (vcpu0, _) = create_mock_vcpu(0);
        let (vcpu1, _) = create_mock_vcpu(1);
        vcpu0.with_current_cpu_set(|| vcpu1.with_current_cpu_set(|| ()));
    }

    #[test]
    fn test_exit_reason_debug_format() {
        let exit = AxVCpuExitReason::MmioRead {
            addr: GuestPhysAddr::from(0x1000_0000),
            width: axaddrspace::device::AccessWidth::Byte,
            reg: 10,
            reg_width: axaddrspace::device::AccessWidth::Qword,
            signed_ext: false,
        };

        let debug_str = format!("{:?}", exit);
        assert!(debug_str.contains("MmioRead"));
        assert!(debug_str.contains("0x10000000"));
    }

    struct MockPerCpu {
        enabled: bool,
        call_log: CallLog,
    }

    impl AxArchPerCpu for MockPerCpu {
        fn new(_cpu_id: usize) -> AxResult<Self> {
            Ok(Self {
                enabled: false,
                call_log: CallLog::default(),
            })
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn hardware_enable(&mut self) -> AxResult {
            self.enabled = true;
            Ok(())
        }

        fn hardware_disable(&mut self) -> AxResult {
            self.call_log
                .borrow_mut()
                .push("hardware_disable".to_string());
            self.enabled = false;
            Ok(())
        }
    }

    fn init_mock_percpu(cpu_id: usize) -> (AxPerCpu<MockPerCpu>, CallLog) {
        let mut percpu = AxPerCpu::<MockPerCpu>::new_uninit();
        percpu.init(cpu_id).unwrap();
        let call_log = percpu.arch_checked().call_log.clone();
        (percpu, call_log)
    }

    #[test]
    fn test_percpu_drop_disables_enabled_state() {
        let (mut percpu, call_log) = init_mock_percpu(0);
        percpu.hardware_enable().unwrap();
        drop(percpu);
        assert_eq!(*call_log.borrow(), ["hardware_disable"]);

        // Nothing to undo for a slot that was never enabled.
        let (percpu, call_log) = init_mock_percpu(1);
        drop(percpu);
        assert!(call_log.borrow().is_empty());
    }

    #[test]
    fn test_percpu_init_once() {
        let mut percpu = AxPerCpu::<MockPerCpu>::new_uninit();
        assert_eq!(percpu.cpu_id(), None);

        percpu.init(2).unwrap();
        assert_eq!(percpu.cpu_id(), Some(2));
        assert_eq!(percpu.init(2).unwrap_err(), AxError::BadState);
        assert_eq!(percpu.arch_checked().max_guest_page_table_levels(), 4);

        percpu.hardware_enable().unwrap();
        assert!(percpu.is_enabled());
        percpu.hardware_disable().unwrap();
        assert!(!percpu.is_enabled());
    }

    #[test]
    #[should_panic(expected = "per-CPU state is not initialized")]
    fn test_percpu_uninit_access_panics() {
        let percpu = AxPerCpu::<MockPerCpu>::new_uninit();
        percpu.is_enabled();
    }
}
