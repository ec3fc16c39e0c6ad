// gpu/kernels.rs — Compiled compute pipelines and the dispatch helper.
//
// All detector shaders share one binding convention:
//
//   @binding(0)      uniform params struct (one Pod struct per family)
//   @binding(1..=n)  storage buffers, `var<storage, read_write>`
//
// so a single explicit bind group layout per storage count is enough and
// every launch goes through `GpuKernels::dispatch`. No buffer is ever bound
// twice in one dispatch: kernels that read and write the same buffer at
// different offsets (`conv_tri_rows_within`) take it once.
//
// PIPELINE LIFETIME
// ─────────────────
// Shader compilation is the expensive part. `GpuKernels::new` compiles every
// entry point once when the `Device` is created; dispatches only allocate a
// small uniform buffer and a bind group.
//
// WORKGROUP SIZE
// ──────────────
// naga does not accept `override` expressions in @workgroup_size(), so the
// {{WG_X}} / {{WG_Y}} tokens in each shader are replaced with the device's
// workgroup dimensions before compilation. 1-D kernels (row scans, prefix
// sums, per-candidate sums) run on a `(n, 1)` grid and simply waste the
// unused y lanes.

use std::collections::HashMap;

use wgpu::util::DeviceExt;

use crate::color;
use crate::gpu::device::GpuDevice;

// ---------------------------------------------------------------------------
// Kernel parameter blocks (must match the WGSL structs field for field)
// ---------------------------------------------------------------------------

/// `ColorParams` in color.wgsl.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct ColorParams {
    pub w: u32,
    pub h: u32,
    pub pad: [u32; 2],
}

/// `ConvParams` in convolution.wgsl. Offsets are in floats; `norm_const`
/// is only read by `mag_norm`.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct ConvParams {
    pub w: u32,
    pub h: u32,
    pub ch: u32,
    pub r: u32,
    pub dst_off: u32,
    pub src_off: u32,
    pub norm_const: f32,
    pub pad: u32,
}

/// `ResampleParams` in resample.wgsl.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct ResampleParams {
    pub dst_w: u32,
    pub dst_h: u32,
    pub src_w: u32,
    pub src_h: u32,
    pub ch: u32,
    pub norm: f32,
    pub pad: [u32; 2],
}

/// `GradParams` in gradient.wgsl.
///
/// `w`/`h` are the grid the kernel runs over: pixels for `grad_mag` and
/// `scale_angle`, histogram cells for `hist` (whose source row pitch is
/// `src_w`).
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct GradParams {
    pub w: u32,
    pub h: u32,
    pub src_w: u32,
    pub bin_size: u32,
    pub num_orients: u32,
    pub scale: f32,
    pub pad: [u32; 2],
}

/// `ConpadParams` in pyramid.wgsl.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct ConpadParams {
    pub w: u32,
    pub h: u32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub out_w: u32,
    pub out_h: u32,
    pub pad: [u32; 2],
}

/// `DetectorParams`, shared by the six cascade passes (cascade.wgsl,
/// compact.wgsl, prefix_sum.wgsl, predict_sum.wgsl).
/// Offsets count elements of the buffer they index: `out_off` cells of
/// the score/index planes, `len_off` rows, `bbs_off` candidates.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct DetectorParams {
    pub depth: u32,
    pub to_org: u32,
    pub org_w: u32,
    pub dims_w: u32,
    pub dims_h: u32,
    pub out_off: u32,
    pub len_off: u32,
    pub bbs_off: u32,
    pub num_weaks: u32,
    pub bbs_sz: u32,
    pub early_weaks: u32,
    pub num_scales: u32,
    pub casc_thr: f32,
    pub pad: [u32; 3],
}

// ---------------------------------------------------------------------------
// Kernel table
// ---------------------------------------------------------------------------

/// (shader label, WGSL template, [(entry point, storage buffer count)])
type ShaderTable = [(&'static str, &'static str, &'static [(&'static str, u32)])];

const SHADERS: &ShaderTable = &[
    ("color.wgsl", include_str!("../shaders/color.wgsl"), &[("rgba_to_luv", 3)]),
    (
        "convolution.wgsl",
        include_str!("../shaders/convolution.wgsl"),
        &[
            ("conv_tri_cols", 2),
            ("conv_tri_rows", 2),
            ("conv_tri_rows_within", 1),
            ("mag_norm", 2),
        ],
    ),
    ("resample.wgsl", include_str!("../shaders/resample.wgsl"), &[("resample", 2)]),
    (
        "gradient.wgsl",
        include_str!("../shaders/gradient.wgsl"),
        &[("grad_mag", 3), ("scale_angle", 1), ("hist", 3)],
    ),
    ("pyramid.wgsl", include_str!("../shaders/pyramid.wgsl"), &[("conpad", 4)]),
    (
        "cascade.wgsl",
        include_str!("../shaders/cascade.wgsl"),
        &[("early_reject", 6), ("predict", 7)],
    ),
    (
        "compact.wgsl",
        include_str!("../shaders/compact.wgsl"),
        &[("early_scan", 3), ("early_bbs", 4)],
    ),
    ("prefix_sum.wgsl", include_str!("../shaders/prefix_sum.wgsl"), &[("early_prefix_sum", 3)]),
    ("predict_sum.wgsl", include_str!("../shaders/predict_sum.wgsl"), &[("predict_sum", 2)]),
];

struct Kernel {
    pipeline: wgpu::ComputePipeline,
    bgl_index: usize,
    storage: u32,
}

/// Every compiled detector kernel plus the read-only lookup tables they
/// share.
pub struct GpuKernels {
    kernels: HashMap<&'static str, Kernel>,
    // One layout per storage buffer count, indexed by count - 1.
    layouts: Vec<wgpu::BindGroupLayout>,
    ltable: wgpu::Buffer,
}

impl GpuKernels {
    /// Compile all shaders for `gpu`'s workgroup size.
    pub fn new(gpu: &GpuDevice) -> Self {
        let max_storage = SHADERS
            .iter()
            .flat_map(|(_, _, entries)| entries.iter().map(|&(_, n)| n))
            .max()
            .unwrap_or(1);
        let layouts: Vec<_> = (1..=max_storage).map(|n| bind_group_layout(gpu, n)).collect();

        let mut kernels = HashMap::new();
        for &(label, template, entries) in SHADERS {
            let source = template
                .replace("{{WG_X}}", &gpu.workgroup_size.x.to_string())
                .replace("{{WG_Y}}", &gpu.workgroup_size.y.to_string());
            let module = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            for &(entry, storage) in entries {
                let bgl_index = storage as usize - 1;
                let layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(entry),
                    bind_group_layouts: &[&layouts[bgl_index]],
                    push_constant_ranges: &[],
                });
                let pipeline =
                    gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some(entry),
                        layout: Some(&layout),
                        module: &module,
                        entry_point: entry,
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        cache: None,
                    });
                kernels.insert(entry, Kernel { pipeline, bgl_index, storage });
            }
        }
        tracing::debug!(kernels = kernels.len(), workgroup = %gpu.workgroup_size, "compiled compute kernels");

        let ltable = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("LUV lightness table"),
            contents: bytemuck::cast_slice(color::ltable()),
            usage: wgpu::BufferUsages::STORAGE,
        });

        GpuKernels { kernels, layouts, ltable }
    }

    /// The LUV lightness lookup table (`color::LTABLE_LEN` floats).
    pub(crate) fn ltable(&self) -> &wgpu::Buffer {
        &self.ltable
    }

    /// Launch `entry` over a `grid.0 × grid.1` invocation grid.
    ///
    /// `buffers` bind to slots 1..=n in order. Empty grids submit nothing.
    pub(crate) fn dispatch<P: bytemuck::Pod>(
        &self,
        gpu: &GpuDevice,
        entry: &str,
        params: &P,
        buffers: &[&wgpu::Buffer],
        grid: (u32, u32),
    ) {
        let kernel = self
            .kernels
            .get(entry)
            .unwrap_or_else(|| panic!("unknown kernel '{entry}'"));
        assert_eq!(
            buffers.len(),
            kernel.storage as usize,
            "kernel '{entry}' binds {} storage buffers",
            kernel.storage
        );
        if grid.0 == 0 || grid.1 == 0 {
            return;
        }

        let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(entry),
            contents: bytemuck::bytes_of(params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let mut entries = Vec::with_capacity(buffers.len() + 1);
        entries.push(wgpu::BindGroupEntry { binding: 0, resource: params_buf.as_entire_binding() });
        for (i, buf) in buffers.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: buf.as_entire_binding(),
            });
        }
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(entry),
            layout: &self.layouts[kernel.bgl_index],
            entries: &entries,
        });

        let (gx, gy) = gpu.dispatch_size(grid.0, grid.1);
        let mut encoder =
            gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(entry) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(entry),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(gx, gy, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }
}

fn bind_group_layout(gpu: &GpuDevice, storage: u32) -> wgpu::BindGroupLayout {
    let mut entries = vec![wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }];
    for binding in 1..=storage {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
    }
    let label = format!("detector BGL ({storage} storage)");
    gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(&label),
        entries: &entries,
    })
}

// ============================================================
// Tests
// ============================================================
