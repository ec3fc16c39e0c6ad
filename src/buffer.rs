// buffer.rs — Device-resident memory with a byte capacity.
//
// A `DeviceBuffer` is created with some capacity (possibly zero, in which
// case no storage exists yet), grows through `reserve`, and moves data
// with `upload` / `download`. Capacity only ever grows: reserving fewer
// bytes than the buffer holds is a no-op, reserving more releases the old
// storage and creates a new one, discarding the previous contents.
//
// TRANSFER ORDERING:
// Uploads are enqueued. On the GPU backend `queue.write_buffer` lands
// before the next submitted command buffer, so a kernel launched after
// an upload sees the uploaded data without the host waiting. Downloads
// either block (`download_sync`) or return a `PendingDownload` whose
// `wait()` blocks later.
//
// CONTRACTS:
// Every transfer asserts that the buffer is large enough. Zero-byte
// transfers are no-ops. Storage is kept in 32-bit words on the host and
// rounded up to a 4-byte multiple on the GPU (wgpu's copy alignment).

use std::sync::mpsc;

use crate::device::{Backend, Device};
use crate::error::Result;
use crate::gpu::device::GpuError;
use crate::matrix::Size;

/// Device-side access intent recorded at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

enum Storage {
    Empty,
    Host(Vec<u32>),
    Gpu(wgpu::Buffer),
}

fn align4(bytes: usize) -> usize {
    (bytes + 3) & !3
}

/// Opaque handle to device memory.
pub struct DeviceBuffer {
    device: Device,
    bytes: usize,
    access: Access,
    storage: Storage,
}

impl DeviceBuffer {
    /// Read-write buffer of `bytes` capacity.
    pub fn create(device: &Device, bytes: usize) -> Self {
        Self::with_access(device, bytes, Access::ReadWrite)
    }

    /// Buffer the kernels only read (filters, classifier tables, lookups).
    pub fn readonly(device: &Device, bytes: usize) -> Self {
        Self::with_access(device, bytes, Access::ReadOnly)
    }

    pub fn writeonly(device: &Device, bytes: usize) -> Self {
        Self::with_access(device, bytes, Access::WriteOnly)
    }

    pub fn with_access(device: &Device, bytes: usize, access: Access) -> Self {
        DeviceBuffer {
            device: device.clone(),
            bytes,
            access,
            storage: allocate(device, bytes, access),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.bytes
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// Ensure at least `bytes` of capacity.
    ///
    /// No-op when the buffer is already large enough. Otherwise the old
    /// storage is released and a new one created: previous contents are
    /// lost.
    pub fn reserve(&mut self, bytes: usize) {
        if self.bytes >= bytes {
            return;
        }
        tracing::trace!(from = self.bytes, to = bytes, access = ?self.access, "buffer grows");
        self.release();
        self.storage = allocate(&self.device, bytes, self.access);
        self.bytes = bytes;
    }

    /// Drop the storage; capacity becomes zero.
    pub fn release(&mut self) {
        if let Storage::Gpu(buf) = std::mem::replace(&mut self.storage, Storage::Empty) {
            buf.destroy();
        }
        self.bytes = 0;
    }

    /// Enqueue a copy of `data` to the start of the buffer.
    pub fn upload(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        assert!(
            data.len() <= self.bytes,
            "upload of {} bytes exceeds buffer capacity {}",
            data.len(),
            self.bytes
        );
        match &mut self.storage {
            Storage::Host(words) => {
                bytemuck::cast_slice_mut::<u32, u8>(words)[..data.len()].copy_from_slice(data);
            }
            Storage::Gpu(buf) => {
                let Backend::Gpu(ctx) = self.device.backend() else {
                    unreachable!("GPU storage on a host device")
                };
                if data.len() % 4 == 0 {
                    ctx.gpu.queue.write_buffer(buf, 0, data);
                } else {
                    let mut padded = data.to_vec();
                    padded.resize(align4(data.len()), 0);
                    ctx.gpu.queue.write_buffer(buf, 0, &padded);
                }
            }
            Storage::Empty => unreachable!("non-empty upload into an unallocated buffer"),
        }
    }

    /// Enqueue a typed upload.
    pub fn upload_slice<T: bytemuck::Pod>(&mut self, data: &[T]) {
        self.upload(bytemuck::cast_slice(data));
    }

    /// Upload a 2-D region whose rows are `stride` bytes apart in `data`,
    /// packing them tightly (row pitch `size.w * pixel_bytes`) in the
    /// buffer.
    pub fn upload_2d(&mut self, data: &[u8], size: Size, pixel_bytes: usize, stride: usize) {
        let row = size.w * pixel_bytes;
        if row == 0 || size.h == 0 {
            return;
        }
        assert!(stride >= row, "stride {stride} is shorter than a row of {row} bytes");
        assert!(
            data.len() >= stride * (size.h - 1) + row,
            "2-D upload source of {} bytes is too small for {size} with stride {stride}",
            data.len()
        );
        if stride == row {
            self.upload(&data[..row * size.h]);
            return;
        }
        let mut packed = Vec::with_capacity(row * size.h);
        for y in 0..size.h {
            packed.extend_from_slice(&data[y * stride..y * stride + row]);
        }
        self.upload(&packed);
    }

    /// Start copying the first `bytes` bytes back to the host.
    pub fn download(&self, bytes: usize) -> PendingDownload {
        assert!(
            bytes <= self.bytes,
            "download of {bytes} bytes exceeds buffer capacity {}",
            self.bytes
        );
        if bytes == 0 {
            return PendingDownload { bytes, state: Pending::Ready(Vec::new()) };
        }
        match &self.storage {
            Storage::Host(words) => PendingDownload {
                bytes,
                state: Pending::Ready(bytemuck::cast_slice::<u32, u8>(words)[..bytes].to_vec()),
            },
            Storage::Gpu(buf) => {
                let Backend::Gpu(ctx) = self.device.backend() else {
                    unreachable!("GPU storage on a host device")
                };
                let size = align4(bytes) as u64;
                let staging = ctx.gpu.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("DeviceBuffer::download"),
                    size,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let mut encoder = ctx.gpu.device.create_command_encoder(
                    &wgpu::CommandEncoderDescriptor { label: Some("DeviceBuffer::download") },
                );
                encoder.copy_buffer_to_buffer(buf, 0, &staging, 0, size);
                ctx.gpu.queue.submit(std::iter::once(encoder.finish()));

                let (tx, rx) = mpsc::channel();
                staging.slice(..).map_async(wgpu::MapMode::Read, move |r| {
                    // The receiver may be gone if the download was abandoned.
                    let _ = tx.send(r);
                });
                PendingDownload {
                    bytes,
                    state: Pending::Mapping { device: self.device.clone(), staging, rx },
                }
            }
            Storage::Empty => unreachable!("non-empty download from an unallocated buffer"),
        }
    }

    /// Blocking download of `out.len()` bytes.
    pub fn download_sync(&self, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let data = self.download(out.len()).wait()?;
        out.copy_from_slice(&data);
        Ok(())
    }

    /// Blocking download into a typed slice.
    pub fn download_slice<T: bytemuck::Pod>(&self, out: &mut [T]) -> Result<()> {
        self.download_sync(bytemuck::cast_slice_mut(out))
    }

    /// Blocking download of the first `n` floats.
    pub fn read_f32(&self, n: usize) -> Result<Vec<f32>> {
        let mut out = vec![0.0f32; n];
        self.download_slice(&mut out)?;
        Ok(out)
    }

    /// Blocking download of the first `n` 32-bit integers.
    pub fn read_i32(&self, n: usize) -> Result<Vec<i32>> {
        let mut out = vec![0i32; n];
        self.download_slice(&mut out)?;
        Ok(out)
    }

    // --- Backend access for kernels ---

    fn host_words(&self) -> &[u32] {
        match &self.storage {
            Storage::Host(words) => words,
            Storage::Empty => &[],
            Storage::Gpu(_) => panic!("host view of a GPU buffer"),
        }
    }

    fn host_words_mut(&mut self) -> &mut [u32] {
        match &mut self.storage {
            Storage::Host(words) => words,
            Storage::Empty => &mut [],
            Storage::Gpu(_) => panic!("host view of a GPU buffer"),
        }
    }

    pub(crate) fn host_f32(&self) -> &[f32] {
        bytemuck::cast_slice(self.host_words())
    }

    pub(crate) fn host_f32_mut(&mut self) -> &mut [f32] {
        bytemuck::cast_slice_mut(self.host_words_mut())
    }

    pub(crate) fn host_i32(&self) -> &[i32] {
        bytemuck::cast_slice(self.host_words())
    }

    pub(crate) fn host_i32_mut(&mut self) -> &mut [i32] {
        bytemuck::cast_slice_mut(self.host_words_mut())
    }

    pub(crate) fn host_u32(&self) -> &[u32] {
        self.host_words()
    }

    /// The wgpu buffer behind a GPU-backed, non-empty buffer.
    pub(crate) fn raw(&self) -> &wgpu::Buffer {
        match &self.storage {
            Storage::Gpu(buf) => buf,
            Storage::Empty => panic!("kernel operand has no storage (capacity 0)"),
            Storage::Host(_) => panic!("wgpu view of a host buffer"),
        }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device)
            .field("bytes", &self.bytes)
            .field("access", &self.access)
            .finish()
    }
}

fn allocate(device: &Device, bytes: usize, access: Access) -> Storage {
    if bytes == 0 {
        return Storage::Empty;
    }
    match device.backend() {
        Backend::Host => Storage::Host(vec![0; align4(bytes) / 4]),
        Backend::Gpu(ctx) => Storage::Gpu(ctx.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(match access {
                Access::ReadWrite => "DeviceBuffer (rw)",
                Access::ReadOnly => "DeviceBuffer (ro)",
                Access::WriteOnly => "DeviceBuffer (wo)",
            }),
            size: align4(bytes) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })),
    }
}

// ---------------------------------------------------------------------------
// PendingDownload
// ---------------------------------------------------------------------------

enum Pending {
    Ready(Vec<u8>),
    Mapping {
        device: Device,
        staging: wgpu::Buffer,
        rx: mpsc::Receiver<std::result::Result<(), wgpu::BufferAsyncError>>,
    },
}

/// An enqueued device-to-host copy.
#[must_use = "a download does nothing until waited on"]
pub struct PendingDownload {
    bytes: usize,
    state: Pending,
}

impl PendingDownload {
    /// Block until the copy has landed and return its bytes.
    pub fn wait(self) -> Result<Vec<u8>> {
        match self.state {
            Pending::Ready(data) => Ok(data),
            Pending::Mapping { device, staging, rx } => {
                device.finish();
                rx.recv()
                    .map_err(|_| GpuError::CallbackDropped)?
                    .map_err(GpuError::BufferMap)?;
                let data = staging.slice(..).get_mapped_range()[..self.bytes].to_vec();
                staging.unmap();
                Ok(data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_has_no_storage() {
        let dev = Device::host();
        let buf = DeviceBuffer::create(&dev, 0);
        assert_eq!(buf.capacity(), 0);
        assert!(buf.host_f32().is_empty());
        // Zero-byte transfers are no-ops even without storage.
        let mut buf = buf;
        buf.upload(&[]);
        buf.download_sync(&mut []).unwrap();
    }

    #[test]
    fn test_reserve_smaller_keeps_contents() {
        let dev = Device::host();
        let mut buf = DeviceBuffer::create(&dev, 16);
        buf.upload_slice(&[1.0f32, 2.0, 3.0, 4.0]);
        buf.reserve(8);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.read_f32(4).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_reserve_larger_grows() {
        let dev = Device::host();
        let mut buf = DeviceBuffer::readonly(&dev, 4);
        buf.reserve(40);
        assert!(buf.capacity() >= 40);
        assert_eq!(buf.access(), Access::ReadOnly);
        assert_eq!(buf.host_f32().len(), 10);
    }

    #[test]
    fn test_upload_2d_packs_rows() {
        let dev = Device::host();
        let mut buf = DeviceBuffer::create(&dev, 8);
        // Two rows of 4 bytes with a stride of 6.
        let src = [1u8, 2, 3, 4, 99, 99, 5, 6, 7, 8];
        buf.upload_2d(&src, Size::new(1, 2), 4, 6);
        let mut out = [0u8; 8];
        buf.download_sync(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_async_download_on_host_is_ready() {
        let dev = Device::host();
        let mut buf = DeviceBuffer::create(&dev, 8);
        buf.upload_slice(&[7i32, -3]);
        let pending = buf.download(8);
        let bytes = pending.wait().unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, i32>(&bytes), &[7, -3]);
    }

    #[test]
    fn test_release_zeroes_capacity() {
        let dev = Device::host();
        let mut buf = DeviceBuffer::create(&dev, 64);
        buf.release();
        assert_eq!(buf.capacity(), 0);
        buf.reserve(4);
        assert_eq!(buf.capacity(), 4);
    }

    #[test]
    #[should_panic(expected = "exceeds buffer capacity")]
    fn test_upload_too_large_panics() {
        let dev = Device::host();
        let mut buf = DeviceBuffer::create(&dev, 4);
        buf.upload(&[0u8; 8]);
    }
}
