// device.rs — Compute context shared by buffers and kernels.
//
// Every device buffer and every kernel launch belongs to one `Device`.
// Two backends exist:
//
//   Host   the CPU reference. Kernels run inline on the calling thread,
//          so each one trivially observes the results of the previous.
//   Gpu    wgpu compute on one queue. Kernels are submitted in order and
//          the queue guarantees each sees its predecessors' writes; the
//          host only blocks when it downloads.
//
// `Device` is a cheap handle (`Arc`) so buffers can keep a reference to
// the context that created them, and kernels can assert that all their
// operands live on the same one.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::gpu::device::{DeviceProfile, GpuDevice};
use crate::gpu::kernels::GpuKernels;

/// A wgpu device together with its compiled kernels.
pub struct GpuContext {
    pub gpu: GpuDevice,
    pub(crate) kernels: GpuKernels,
}

/// Which implementation executes the kernels.
pub enum Backend {
    Host,
    Gpu(GpuContext),
}

/// Handle to a compute context.
#[derive(Clone)]
pub struct Device {
    inner: Arc<Backend>,
}

impl Device {
    /// CPU reference backend.
    pub fn host() -> Self {
        Device { inner: Arc::new(Backend::Host) }
    }

    /// wgpu backend on the first hardware adapter.
    pub fn gpu() -> Result<Self> {
        Self::gpu_with_profile(DeviceProfile::Native)
    }

    pub fn gpu_with_profile(profile: DeviceProfile) -> Result<Self> {
        let gpu = GpuDevice::new_with_profile(profile)?;
        Ok(Self::from_gpu(gpu))
    }

    /// Wrap an already created `GpuDevice`, compiling every kernel.
    pub fn from_gpu(gpu: GpuDevice) -> Self {
        let kernels = GpuKernels::new(&gpu);
        Device { inner: Arc::new(Backend::Gpu(GpuContext { gpu, kernels })) }
    }

    pub fn backend(&self) -> &Backend {
        &self.inner
    }

    pub fn is_host(&self) -> bool {
        matches!(*self.inner, Backend::Host)
    }

    /// True if both handles refer to the same context.
    pub fn same_as(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Block until all submitted work has completed.
    pub fn finish(&self) {
        if let Backend::Gpu(ctx) = self.backend() {
            ctx.gpu.wait_idle();
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.backend() {
            Backend::Host => write!(f, "Device(Host)"),
            Backend::Gpu(ctx) => write!(f, "Device({})", ctx.gpu),
        }
    }
}
