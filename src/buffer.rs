//! Typed GPU buffers and host readback utilities.
//!
//! This module defines a [`GpuBuffer`] wrapper around [`wgpu::Buffer`]
//! that tracks the number of typed elements stored in the buffer and how
//! kernels may access it. The intent of a buffer is spelled out in a
//! [`BufferConfig`] value rather than in raw usage flags, and every buffer
//! is created through [`GpuBuffer::create`].

use std::marker::PhantomData;
use std::sync::mpsc;

use bytemuck::{cast_slice, Pod};
use log::debug;
use wgpu::util::{BufferInitDescriptor, DeviceExt};
use wgpu::{Buffer, BufferDescriptor, BufferUsages};

use crate::error::{Error, Result};
use crate::tracker::{ResourceGuard, ResourceKind};
use crate::GpuContext;

/// How kernels may access a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    /// Whether a kernel may write through this access mode.
    pub fn writable(self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

/// Buffer intent, independent of how wgpu encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    pub access: Access,
    /// Initialise the buffer through a mapping of host memory at creation
    /// instead of a separate queue upload. Only meaningful when the buffer
    /// is created from data.
    pub host_aliasing: bool,
}

impl BufferConfig {
    pub const fn read_only() -> Self {
        Self {
            access: Access::ReadOnly,
            host_aliasing: false,
        }
    }

    pub const fn write_only() -> Self {
        Self {
            access: Access::WriteOnly,
            host_aliasing: false,
        }
    }

    pub const fn read_write() -> Self {
        Self {
            access: Access::ReadWrite,
            host_aliasing: false,
        }
    }

    pub const fn with_host_aliasing(mut self, host_aliasing: bool) -> Self {
        self.host_aliasing = host_aliasing;
        self
    }

    /// wgpu usage flags for this configuration.
    ///
    /// Readable inputs need `COPY_DST` for queue uploads; writable buffers
    /// need `COPY_SRC` so results can be copied to a staging buffer.
    pub fn usages(&self) -> BufferUsages {
        let transfer = match self.access {
            Access::ReadOnly => BufferUsages::COPY_DST,
            Access::WriteOnly => BufferUsages::COPY_SRC,
            Access::ReadWrite => BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
        };
        BufferUsages::STORAGE | transfer
    }

    /// Storage binding type for this configuration. WGSL has no write-only
    /// storage buffers, so write-only buffers bind as read-write.
    pub fn binding_read_only(&self) -> bool {
        !self.access.writable()
    }
}

/// Initial contents of a new buffer.
#[derive(Debug, Clone, Copy)]
pub enum BufferContents<'a, T> {
    /// Upload these elements.
    Data(&'a [T]),
    /// Leave room for this many elements, zero-initialised by wgpu.
    Len(usize),
}

impl<T> BufferContents<'_, T> {
    pub fn len(&self) -> usize {
        match self {
            BufferContents::Data(data) => data.len(),
            BufferContents::Len(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Size in bytes of `len` elements of `T`, rounded up to wgpu's copy
/// alignment. `None` on overflow.
pub(crate) fn padded_size<T>(len: usize) -> Option<u64> {
    let bytes = len.checked_mul(std::mem::size_of::<T>())? as u64;
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    bytes.checked_add(align - 1).map(|b| b / align * align)
}

/// A typed GPU buffer.
///
/// The length records how many elements of type `T` are stored. The
/// allocation may be slightly larger to satisfy copy alignment. Dropping
/// the buffer destroys the device allocation immediately.
pub struct GpuBuffer<T: Pod> {
    pub buffer: Buffer,
    pub len: usize,
    pub config: BufferConfig,
    label: String,
    _guard: ResourceGuard,
    _marker: PhantomData<T>,
}

impl<T: Pod> GpuBuffer<T> {
    /// Create a storage buffer.
    ///
    /// The size is checked against the device's binding limits before
    /// anything is allocated; allocation and validation errors raised by
    /// the driver are reported as [`Error::ResourceAllocationFailed`].
    pub fn create(
        context: &GpuContext,
        label: &str,
        contents: BufferContents<'_, T>,
        config: BufferConfig,
    ) -> Result<Self> {
        let size = allocation_size::<T>(context, label, contents.len())?;
        let host_aliasing = config.host_aliasing && matches!(contents, BufferContents::Data(_));

        let (buffer, error) = context.capture_errors(|device| {
            if let (BufferContents::Data(data), true) = (contents, host_aliasing) {
                // Contents are copied through a mapping made at creation.
                return device.create_buffer_init(&BufferInitDescriptor {
                    label: Some(label),
                    contents: cast_slice(data),
                    usage: config.usages(),
                });
            }
            let buffer = device.create_buffer(&BufferDescriptor {
                label: Some(label),
                size,
                usage: config.usages(),
                mapped_at_creation: false,
            });
            if let BufferContents::Data(data) = contents {
                let bytes: &[u8] = cast_slice(data);
                if bytes.len() as u64 == size {
                    context.queue.write_buffer(&buffer, 0, bytes);
                } else {
                    // write_buffer needs an aligned length.
                    let mut padded = bytes.to_vec();
                    padded.resize(size as usize, 0);
                    context.queue.write_buffer(&buffer, 0, &padded);
                }
            }
            buffer
        });
        if let Some(e) = error {
            return Err(Error::ResourceAllocationFailed {
                label: label.to_string(),
                bytes: size,
                reason: e.to_string(),
            });
        }

        debug!(
            "created buffer `{label}`: {} x {} bytes, {:?}, host aliasing {host_aliasing}",
            contents.len(),
            std::mem::size_of::<T>(),
            config.access
        );
        Ok(Self {
            buffer,
            len: contents.len(),
            config,
            label: label.to_string(),
            _guard: context.tracker().acquire(ResourceKind::Buffer),
            _marker: PhantomData,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Size of the payload in bytes, without alignment padding.
    pub fn byte_len(&self) -> u64 {
        (self.len * std::mem::size_of::<T>()) as u64
    }

    /// Read the contents of the buffer back to the CPU.
    ///
    /// The buffer is copied into a mappable staging buffer, which is then
    /// mapped. This blocks the current thread until the GPU has finished
    /// all previously submitted work that writes to the buffer.
    pub fn read_to_vec(&self, context: &GpuContext) -> Result<Vec<T>> {
        if !self.config.usages().contains(BufferUsages::COPY_SRC) {
            return Err(Error::ExecutionFailed(format!(
                "buffer `{}` is read-only and cannot be read back",
                self.label
            )));
        }
        let size = self.buffer.size();
        let staging = Staging::new(context, &self.label, size)?;

        let mut encoder = context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback_encoder"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging.buffer, 0, size);
        context.queue.submit([encoder.finish()]);

        let slice = staging.buffer.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            // The receiver outlives the poll below; a send error only means
            // the read-back was already abandoned.
            let _ = sender.send(result);
        });
        context
            .device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| Error::ExecutionFailed(format!("waiting for read-back: {e}")))?;
        receiver
            .recv()
            .map_err(|_| Error::ExecutionFailed("read-back map callback never fired".into()))?
            .map_err(|e| Error::ExecutionFailed(format!("mapping `{}`: {e}", self.label)))?;

        let data = slice.get_mapped_range();
        let result: Vec<T> = cast_slice(&data[..self.byte_len() as usize]).to_vec();
        drop(data);
        staging.buffer.unmap();
        Ok(result)
    }
}

impl<T: Pod> Drop for GpuBuffer<T> {
    fn drop(&mut self) {
        self.buffer.destroy();
    }
}

impl<T: Pod> std::fmt::Debug for GpuBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("label", &self.label)
            .field("len", &self.len)
            .field("config", &self.config)
            .finish()
    }
}

/// Host-mappable copy target used by [`GpuBuffer::read_to_vec`].
struct Staging {
    buffer: Buffer,
    _guard: ResourceGuard,
}

impl Staging {
    fn new(context: &GpuContext, label: &str, size: u64) -> Result<Self> {
        let staging_label = format!("{label}_staging");
        let (buffer, error) = context.capture_errors(|device| {
            device.create_buffer(&BufferDescriptor {
                label: Some(staging_label.as_str()),
                size,
                usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
                mapped_at_creation: false,
            })
        });
        if let Some(e) = error {
            return Err(Error::ResourceAllocationFailed {
                label: staging_label,
                bytes: size,
                reason: e.to_string(),
            });
        }
        Ok(Self {
            buffer,
            _guard: context.tracker().acquire(ResourceKind::Buffer),
        })
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        self.buffer.destroy();
    }
}

fn allocation_size<T>(context: &GpuContext, label: &str, len: usize) -> Result<u64> {
    if len == 0 {
        return Err(Error::InvalidLength { len });
    }
    let size = padded_size::<T>(len).ok_or_else(|| Error::ResourceAllocationFailed {
        label: label.to_string(),
        bytes: u64::MAX,
        reason: "size overflows the address space".into(),
    })?;
    let max = context.max_binding_bytes();
    if size > max {
        return Err(Error::ResourceAllocationFailed {
            label: label.to_string(),
            bytes: size,
            reason: format!("exceeds the device binding limit of {max} bytes"),
        });
    }
    Ok(size)
}
