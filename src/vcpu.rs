use core::cell::{Cell, UnsafeCell};

use axaddrspace::{GuestPhysAddr, HostPhysAddr};
use axerrno::{ax_err, AxResult};

use super::{AxArchVCpu, AxVCpuExitReason, VCpuId, VMId};

/// Identity and placement of a vcpu, fixed at creation.
struct VCpuPlacement {
    vm_id: VMId,
    id: VCpuId,
    /// The physical CPU preferred for running this vcpu.
    favor_phys_cpu: usize,
    /// Bitmap of the physical CPUs allowed to run this vcpu, `None` for any.
    /// Same layout as [CPU_SET](https://man7.org/linux/man-pages/man3/CPU_SET.3.html) in Linux.
    phys_cpu_set: Option<usize>,
}

/// Lifecycle state of a virtual CPU.
///
/// ```text
/// Created --setup--> Free --bind--> Ready --run--> Running
///                     ^               |  ^            |
///                     +----unbind-----+  +------------+
/// ```
///
/// Any failed operation leaves the vcpu [`VCpuState::Invalid`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuState {
    /// A failed operation or transition made the vcpu unusable.
    Invalid = 0,
    /// Just created, entry and page table are not set.
    Created = 1,
    /// Set up, not attached to any physical CPU.
    Free = 2,
    /// Bound to the current physical CPU, waiting to be run.
    Ready = 3,
    /// Executing guest code.
    Running = 4,
    /// Waiting for an event, e.g. after the guest executed `wfi`.
    Blocked = 5,
}

/// An architecture-independent virtual CPU.
///
/// The architecture part is an [`AxArchVCpu`] such as [`RISCVVCpu`](crate::RISCVVCpu).
/// `AxVCpu` checks the [`VCpuState`] before every operation and publishes itself as the
/// current vcpu of the physical CPU while the architecture code runs.
///
/// All methods take `&self`; the state lives in a [`Cell`] and the architecture part in an
/// [`UnsafeCell`]. The type is not thread-safe, callers serialize access.
pub struct AxVCpu<A: AxArchVCpu> {
    placement: VCpuPlacement,
    state: Cell<VCpuState>,
    /// A guard type cannot be used here: the borrow would have to stay alive across the
    /// world switch into the guest.
    arch_vcpu: UnsafeCell<A>,
}

impl<A: AxArchVCpu> AxVCpu<A> {
    /// Creates vcpu `id` of VM `vm_id`, in the [`VCpuState::Created`] state.
    pub fn new(
        vm_id: VMId,
        id: VCpuId,
        favor_phys_cpu: usize,
        phys_cpu_set: Option<usize>,
        arch_config: A::CreateConfig,
    ) -> AxResult<Self> {
        let arch_vcpu = A::new(vm_id, id, arch_config)?;
        Ok(Self {
            placement: VCpuPlacement {
                vm_id,
                id,
                favor_phys_cpu,
                phys_cpu_set,
            },
            state: Cell::new(VCpuState::Created),
            arch_vcpu: UnsafeCell::new(arch_vcpu),
        })
    }

    /// Sets the guest entry point and the G-stage page table root, then finishes the
    /// architecture setup. `Created` → `Free`.
    pub fn setup(
        &self,
        entry: GuestPhysAddr,
        ept_root: HostPhysAddr,
        arch_config: A::SetupConfig,
    ) -> AxResult {
        self.manipulate_arch_vcpu(VCpuState::Created, VCpuState::Free, |arch_vcpu| {
            arch_vcpu.set_entry(entry)?;
            arch_vcpu.set_ept_root(ept_root)?;
            arch_vcpu.setup(arch_config)
        })
    }

    /// The VM this vcpu belongs to.
    pub const fn vm_id(&self) -> VMId {
        self.placement.vm_id
    }

    /// The id of this vcpu inside its VM.
    pub const fn id(&self) -> VCpuId {
        self.placement.id
    }

    /// The physical CPU preferred for running this vcpu. Not used for scheduling yet.
    pub const fn favor_phys_cpu(&self) -> usize {
        self.placement.favor_phys_cpu
    }

    /// The physical CPUs allowed to run this vcpu, `None` if it may run anywhere.
    pub const fn phys_cpu_set(&self) -> Option<usize> {
        self.placement.phys_cpu_set
    }

    /// Whether this is the bootstrap processor, which is always vcpu 0.
    pub const fn is_bsp(&self) -> bool {
        self.placement.id == 0
    }

    /// The current lifecycle state.
    pub fn state(&self) -> VCpuState {
        self.state.get()
    }

    /// Overwrites the lifecycle state.
    ///
    /// # Safety
    /// Skipping the checked transitions may run the architecture code in a state it does not
    /// expect.
    pub unsafe fn set_state(&self, state: VCpuState) {
        self.state.set(state);
    }

    /// Runs `f` as the transition from `from` to `to`.
    ///
    /// Fails with `BadState` if the vcpu is not in `from`. Both that and an error from `f` leave
    /// the vcpu [`VCpuState::Invalid`]; otherwise it ends in `to`.
    pub fn with_state_transition<F, T>(&self, from: VCpuState, to: VCpuState, f: F) -> AxResult<T>
    where
        F: FnOnce() -> AxResult<T>,
    {
        let current = self.state.get();
        if current != from {
            self.state.set(VCpuState::Invalid);
            return ax_err!(
                BadState,
                format!(
                    "VCpu[{}:{}] is {:?}, expected {:?}",
                    self.vm_id(),
                    self.id(),
                    current,
                    from
                )
            );
        }

        let result = f();
        self.state.set(match result {
            Ok(_) => to,
            Err(_) => VCpuState::Invalid,
        });
        result
    }

    /// Runs `f` with this vcpu published as the current vcpu of the physical CPU.
    ///
    /// # Panics
    /// If another vcpu is already current on this physical CPU.
    pub fn with_current_cpu_set<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        if get_current_vcpu::<A>().is_some() {
            panic!("VCpu[{}:{}]: nested vcpu operation", self.vm_id(), self.id());
        }
        unsafe { set_current_vcpu(self) };
        let result = f();
        unsafe { clear_current_vcpu::<A>() };
        result
    }

    /// [`AxVCpu::with_state_transition`] and [`AxVCpu::with_current_cpu_set`] around an
    /// operation on the architecture vcpu.
    pub fn manipulate_arch_vcpu<F, T>(&self, from: VCpuState, to: VCpuState, f: F) -> AxResult<T>
    where
        F: FnOnce(&mut A) -> AxResult<T>,
    {
        self.with_state_transition(from, to, || {
            self.with_current_cpu_set(|| f(self.get_arch_vcpu()))
        })
    }

    /// Moves from `from` to `to` without doing anything else.
    pub fn transition_state(&self, from: VCpuState, to: VCpuState) -> AxResult {
        self.with_state_transition(from, to, || Ok(()))
    }

    /// The architecture vcpu.
    #[allow(clippy::mut_from_ref)]
    pub fn get_arch_vcpu(&self) -> &mut A {
        unsafe { &mut *self.arch_vcpu.get() }
    }

    /// Enters the guest until the next exit the hypervisor has to see.
    ///
    /// The vcpu is `Running` meanwhile and back to `Ready` afterwards.
    pub fn run(&self) -> AxResult<AxVCpuExitReason> {
        self.transition_state(VCpuState::Ready, VCpuState::Running)?;
        self.manipulate_arch_vcpu(VCpuState::Running, VCpuState::Ready, |arch_vcpu| {
            arch_vcpu.run()
        })
    }

    /// Binds the vcpu to the current physical CPU. `Free` → `Ready`.
    pub fn bind(&self) -> AxResult {
        self.manipulate_arch_vcpu(VCpuState::Free, VCpuState::Ready, A::bind)
    }

    /// Releases the current physical CPU. `Ready` → `Free`.
    pub fn unbind(&self) -> AxResult {
        self.manipulate_arch_vcpu(VCpuState::Ready, VCpuState::Free, A::unbind)
    }

    /// Sets argument register `reg` (`a0`-`a7` on RISC-V).
    pub fn set_gpr(&self, reg: usize, val: usize) {
        self.get_arch_vcpu().set_gpr(reg, val);
    }

    /// Queues interrupt `vector` for the guest.
    pub fn inject_interrupt(&self, vector: usize) -> AxResult {
        self.get_arch_vcpu().inject_interrupt(vector)
    }

    /// Sets the result the guest sees for its trapping instruction.
    pub fn set_return_value(&self, val: usize) {
        self.get_arch_vcpu().set_return_value(val);
    }
}

#[percpu::def_percpu]
static mut CURRENT_VCPU: Option<*mut u8> = None;

/// The vcpu operated on by the current physical CPU.
///
/// Set by [`AxVCpu`] around every call into [`AxArchVCpu`], so architecture code can reach
/// the `AxVCpu` containing it.
pub fn get_current_vcpu<'a, A: AxArchVCpu>() -> Option<&'a AxVCpu<A>> {
    unsafe {
        CURRENT_VCPU
            .current_ref_raw()
            .as_ref()
            .copied()
            .and_then(|p| (p as *const AxVCpu<A>).as_ref())
    }
}

/// Mutable version of [`get_current_vcpu`].
pub fn get_current_vcpu_mut<'a, A: AxArchVCpu>() -> Option<&'a mut AxVCpu<A>> {
    unsafe {
        CURRENT_VCPU
            .current_ref_mut_raw()
            .as_mut()
            .copied()
            .and_then(|p| (p as *mut AxVCpu<A>).as_mut())
    }
}

/// Publishes `vcpu` as the current vcpu of this physical CPU.
///
/// # Safety
/// `vcpu` must outlive its publication, and `A` must match the type later passed to
/// [`get_current_vcpu`].
pub unsafe fn set_current_vcpu<A: AxArchVCpu>(vcpu: &AxVCpu<A>) {
    CURRENT_VCPU
        .current_ref_mut_raw()
        .replace(vcpu as *const _ as *mut u8);
}

/// Withdraws the current vcpu of this physical CPU.
///
/// # Safety
/// Must pair with [`set_current_vcpu`].
pub unsafe fn clear_current_vcpu<A: AxArchVCpu>() {
    CURRENT_VCPU.current_ref_mut_raw().take();
}
