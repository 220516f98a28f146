use core::mem::MaybeUninit;

use axerrno::{ax_err, AxResult};

/// Per-CPU, architecture-specific virtualization state.
///
/// [`RISCVPerCpu`](crate::RISCVPerCpu) implements this for the H extension: enabling it
/// programs the exception/interrupt delegation CSRs of the hart it runs on.
pub trait AxArchPerCpu: Sized {
    /// Builds the state for CPU `cpu_id` without touching the hardware.
    fn new(cpu_id: usize) -> AxResult<Self>;
    /// Whether [`AxArchPerCpu::hardware_enable`] succeeded and was not undone.
    fn is_enabled(&self) -> bool;
    /// Turns virtualization on for the calling CPU.
    fn hardware_enable(&mut self) -> AxResult;
    /// Turns virtualization off for the calling CPU.
    fn hardware_disable(&mut self) -> AxResult;
    /// Number of levels of the guest (second-stage) page tables.
    fn max_guest_page_table_levels(&self) -> usize {
        4
    }
}

/// Slot for the per-CPU virtualization state of one physical CPU.
///
/// Meant to live in a `#[percpu::def_percpu]` static, created empty and filled on each CPU
/// during hypervisor start-up:
///
/// ```ignore
/// #[percpu::def_percpu]
/// pub static AXVM_PER_CPU: AxPerCpu<RISCVPerCpu<MyHal>> = AxPerCpu::new_uninit();
///
/// let percpu = unsafe { AXVM_PER_CPU.current_ref_mut_raw() };
/// percpu.init(hart_id)?;
/// percpu.hardware_enable()?;
/// ```
///
/// Dropping an enabled slot disables virtualization first.
pub struct AxPerCpu<A: AxArchPerCpu> {
    /// `Some` once [`AxPerCpu::init`] has written `arch`.
    cpu_id: Option<usize>,
    arch: MaybeUninit<A>,
}

impl<A: AxArchPerCpu> AxPerCpu<A> {
    /// An empty slot, usable in a `static` initializer.
    pub const fn new_uninit() -> Self {
        Self {
            cpu_id: None,
            arch: MaybeUninit::uninit(),
        }
    }

    /// Creates the architecture state for `cpu_id`. Fails with `BadState` on a second call.
    pub fn init(&mut self, cpu_id: usize) -> AxResult {
        if self.cpu_id.is_some() {
            return ax_err!(BadState, "per-CPU state is already initialized");
        }
        self.arch.write(A::new(cpu_id)?);
        self.cpu_id = Some(cpu_id);
        debug!("per-CPU virtualization state initialized on CPU {}", cpu_id);
        Ok(())
    }

    /// The id given to [`AxPerCpu::init`], `None` before that.
    pub const fn cpu_id(&self) -> Option<usize> {
        self.cpu_id
    }

    /// The architecture state.
    ///
    /// # Panics
    /// If [`AxPerCpu::init`] has not been called.
    pub fn arch_checked(&self) -> &A {
        assert!(self.cpu_id.is_some(), "per-CPU state is not initialized");
        // SAFETY: `init` wrote `arch` before setting `cpu_id`.
        unsafe { self.arch.assume_init_ref() }
    }

    /// Mutable version of [`AxPerCpu::arch_checked`].
    pub fn arch_checked_mut(&mut self) -> &mut A {
        assert!(self.cpu_id.is_some(), "per-CPU state is not initialized");
        // SAFETY: `init` wrote `arch` before setting `cpu_id`.
        unsafe { self.arch.assume_init_mut() }
    }

    /// See [`AxArchPerCpu::is_enabled`].
    pub fn is_enabled(&self) -> bool {
        self.arch_checked().is_enabled()
    }

    /// See [`AxArchPerCpu::hardware_enable`].
    pub fn hardware_enable(&mut self) -> AxResult {
        self.arch_checked_mut().hardware_enable()
    }

    /// See [`AxArchPerCpu::hardware_disable`].
    pub fn hardware_disable(&mut self) -> AxResult {
        self.arch_checked_mut().hardware_disable()
    }
}

impl<A: AxArchPerCpu> Drop for AxPerCpu<A> {
    fn drop(&mut self) {
        if self.cpu_id.is_none() {
            return;
        }
        if self.is_enabled() {
            if let Err(err) = self.hardware_disable() {
                warn!("failed to disable virtualization on drop: {:?}", err);
            }
        }
        // SAFETY: `cpu_id` is `Some`, so `arch` was written by `init`.
        unsafe { self.arch.assume_init_drop() };
    }
}
