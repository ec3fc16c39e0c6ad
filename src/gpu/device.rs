// gpu/device.rs — wgpu adapter and device selection.
//
// Responsibilities:
//   - Enumerate Vulkan adapters and prefer real hardware over software
//     rasterizers.
//   - Expose a `DeviceProfile` that caps device limits to those of a
//     smaller target (Raspberry Pi class GPUs), so dispatches that would
//     fail there already fail on the development machine.
//   - Provide the `WorkgroupSize` every compute pipeline is specialised
//     with.
//
// ADAPTER SELECTION:
// `request_adapter` may pick llvmpipe on machines where the software
// renderer is the first Vulkan device. We enumerate explicitly, take the
// first hardware-like adapter, and only fall back to whatever exists.
//
// DEVICE LIMITS:
// Under a non-Native profile we request *lower* limits than the hardware
// supports. wgpu validates every dispatch against the requested limits.
// The feature pyramid keeps at most eight storage buffers bound per
// dispatch (the full cascade pass), which fits the default limits.

use std::fmt;

/// Hardware profile controlling device limits and default workgroup sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DeviceProfile {
    /// Use the adapter's actual hardware limits.
    Native,
    /// Simulate Raspberry Pi 4/5 (VideoCore VI/VII, V3DV Vulkan):
    /// 256 invocations per workgroup and 128 MiB storage bindings.
    RaspberryPi,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::RaspberryPi => write!(f, "RaspberryPi (simulated limits)"),
        }
    }
}

/// A workgroup size for 2-D compute dispatches.
///
/// Baked into each shader's `@workgroup_size` through the `{{WG_X}}` /
/// `{{WG_Y}}` placeholders when the pipelines are compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// Total invocations per workgroup (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Validated default for the given profile.
    ///
    /// - `Native`: 16×8 = 128 invocations (4 NVIDIA warps, 2 AMD waves).
    /// - `RaspberryPi`: 8×8 = 64, well under the 256 limit.
    pub(crate) fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { x: 16, y: 8 },
            DeviceProfile::RaspberryPi => WorkgroupSize { x: 8, y: 8 },
        }
    }

    /// Workgroups needed to cover a `w × h` grid.
    ///
    /// Shaders guard against the out-of-range invocations of the last
    /// partial workgroup with `if gid.x >= w || gid.y >= h { return; }`.
    pub fn dispatch_size(&self, w: u32, h: u32) -> (u32, u32) {
        ((w + self.x - 1) / self.x, (h + self.y - 1) / self.y)
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Cached adapter information for logging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// Adapter, device, queue and active profile.
///
/// Expensive to create; hold one per process, shared through
/// [`crate::device::Device`].
///
/// # Field drop order
/// Fields drop top to bottom. `_instance` comes last so the Vulkan
/// instance outlives `device` and `queue`; some layered drivers crash
/// when the instance is destroyed first.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// First hardware Vulkan adapter with `Native` limits.
    pub fn new() -> Result<Self, GpuError> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(profile))
    }

    async fn init_async(profile: DeviceProfile) -> Result<Self, GpuError> {
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(wgpu::Backends::VULKAN);
        if adapters.is_empty() {
            return Err(GpuError::NoSuitableAdapter);
        }
        for a in &adapters {
            let info = a.get_info();
            tracing::info!(
                name = %info.name,
                backend = ?info.backend,
                device_type = ?info.device_type,
                "found Vulkan adapter"
            );
        }

        // Hardware first; anything (including CPU renderers) as a last resort.
        let adapter = adapters
            .into_iter()
            .find(|a| !matches!(a.get_info().device_type, wgpu::DeviceType::Cpu))
            .or_else(|| {
                tracing::warn!("no hardware adapter, falling back to a software renderer");
                instance.enumerate_adapters(wgpu::Backends::VULKAN).into_iter().next()
            })
            .ok_or(GpuError::NoSuitableAdapter)?;

        let raw = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw.name.clone(),
            device_type: raw.device_type,
            backend: raw.backend,
        };

        let profile = match profile {
            DeviceProfile::Native if raw.name.to_ascii_lowercase().contains("v3d") => {
                tracing::info!("V3D adapter detected, using RaspberryPi profile");
                DeviceProfile::RaspberryPi
            }
            other => other,
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("acfdet"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits_for_profile(profile),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(GpuError::DeviceRequest)?;

        let workgroup_size = WorkgroupSize::for_profile(profile);
        tracing::info!(adapter = %adapter_info, %profile, workgroup = %workgroup_size, "GPU ready");

        Ok(GpuDevice {
            device,
            queue,
            profile,
            adapter_info,
            workgroup_size,
            _instance: instance,
        })
    }

    /// Override the default workgroup size, validating against the profile.
    ///
    /// Only affects pipelines compiled afterwards.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32) -> Result<(), GpuError> {
        let total = x * y;
        let max = limits_for_profile(self.profile).max_compute_invocations_per_workgroup;
        if total > max {
            return Err(GpuError::WorkgroupTooLarge { total, max });
        }
        self.workgroup_size = WorkgroupSize { x, y };
        Ok(())
    }

    /// Workgroups needed to cover a `w × h` grid with the active size.
    pub fn dispatch_size(&self, w: u32, h: u32) -> (u32, u32) {
        self.workgroup_size.dispatch_size(w, h)
    }

    /// Block until every submitted command has finished.
    pub fn wait_idle(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, profile: {}, workgroup: {} }}",
            self.adapter_info, self.profile, self.workgroup_size
        )
    }
}

// ============================================================
// Limits helpers
// ============================================================

fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),
        DeviceProfile::RaspberryPi => wgpu::Limits {
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

// ============================================================
// Error type
// ============================================================

/// Errors from GPU initialization, configuration and transfers.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error(
        "no suitable Vulkan adapter found; check that Vulkan is installed \
         and `vulkaninfo` lists a device"
    )]
    NoSuitableAdapter,

    #[error("device request failed: {0}")]
    DeviceRequest(#[source] wgpu::RequestDeviceError),

    #[error("workgroup size {total} exceeds profile limit of {max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },

    #[error("failed to map buffer for readback: {0}")]
    BufferMap(#[source] wgpu::BufferAsyncError),

    #[error("readback callback was dropped before completion")]
    CallbackDropped,
}

// ============================================================
// Tests
// ============================================================
