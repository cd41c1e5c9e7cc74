//! Binding buffers to a compiled kernel and dispatching it.
//!
//! A [`Dispatch`] binds buffers to a [`CompiledKernel`] by argument
//! position and runs the kernel once over a 1-D index range. The call
//! blocks until the device reports completion, so anything submitted
//! afterwards (such as a read-back) is ordered after the kernel.

use std::time::{Duration, Instant};

use bytemuck::Pod;
use log::debug;

use crate::buffer::{Access, GpuBuffer};
use crate::error::{Error, Result};
use crate::kernel::CompiledKernel;
use crate::GpuContext;

/// Calculate an (x, y) workgroup grid that covers `len` invocations
/// without exceeding the per-dimension limit.
///
/// The rendered kernels linearise the grid as
/// `gid.x + gid.y * groups_x * workgroup_size`.
pub fn workgroup_grid(len: usize, workgroup_size: u32, max_per_dim: u32) -> Result<(u32, u32)> {
    if workgroup_size == 0 || max_per_dim == 0 {
        return Err(Error::ExecutionFailed(
            "workgroup size and dispatch limit must be non-zero".into(),
        ));
    }
    let total_groups = (len as u64).div_ceil(u64::from(workgroup_size));
    let limit = u64::from(max_per_dim);
    let (x, y) = if total_groups <= limit {
        (total_groups, 1)
    } else {
        (limit, total_groups.div_ceil(limit))
    };
    if y > limit {
        return Err(Error::ExecutionFailed(format!(
            "{len} invocations need {total_groups} workgroups, more than a {limit}x{limit} grid"
        )));
    }
    Ok((x as u32, y as u32))
}

struct Bound<'a> {
    buffer: &'a wgpu::Buffer,
    len: usize,
}

/// One kernel invocation over `[0, len)` with positionally bound buffers.
pub struct Dispatch<'a> {
    kernel: &'a CompiledKernel,
    bound: Vec<Option<Bound<'a>>>,
}

impl<'a> Dispatch<'a> {
    pub fn new(kernel: &'a CompiledKernel) -> Self {
        Self {
            kernel,
            bound: kernel.args().iter().map(|_| None).collect(),
        }
    }

    /// Bind `buffer` as argument `index`.
    ///
    /// The buffer's configured access must allow what the argument does:
    /// a written argument needs a writable buffer and a read argument needs
    /// a readable one.
    pub fn bind<T: Pod>(&mut self, index: usize, buffer: &'a GpuBuffer<T>) -> Result<&mut Self> {
        let arg = self.kernel.args().get(index).ok_or_else(|| {
            Error::ExecutionFailed(format!(
                "kernel `{}` has no argument {index}",
                self.kernel.entry_point()
            ))
        })?;
        if std::mem::size_of::<T>() != std::mem::size_of::<f32>() {
            return Err(Error::ExecutionFailed(format!(
                "argument {index} `{}` expects 32-bit elements",
                arg.name
            )));
        }
        let buffer_access = buffer.config.access;
        if arg.access.writable() && !buffer_access.writable() {
            return Err(Error::ExecutionFailed(format!(
                "argument {index} `{}` is written but buffer `{}` is {buffer_access:?}",
                arg.name,
                buffer.label()
            )));
        }
        if arg.access != Access::WriteOnly && buffer_access == Access::WriteOnly {
            return Err(Error::ExecutionFailed(format!(
                "argument {index} `{}` is read but buffer `{}` is WriteOnly",
                arg.name,
                buffer.label()
            )));
        }
        self.bound[index] = Some(Bound {
            buffer: &buffer.buffer,
            len: buffer.len,
        });
        Ok(self)
    }

    /// Run the kernel once over `[0, len)` and block until it completes.
    ///
    /// Returns the wall-clock time from submission to completion.
    pub fn execute_blocking(&self, context: &GpuContext, len: usize) -> Result<Duration> {
        let mut entries = Vec::with_capacity(self.bound.len());
        for (index, slot) in self.bound.iter().enumerate() {
            let arg = &self.kernel.args()[index];
            let bound = slot.as_ref().ok_or_else(|| {
                Error::ExecutionFailed(format!("argument {index} `{}` is not bound", arg.name))
            })?;
            if bound.len != len {
                return Err(Error::ExecutionFailed(format!(
                    "argument {index} `{}` holds {} elements, dispatch covers {len}",
                    arg.name, bound.len
                )));
            }
            entries.push(wgpu::BindGroupEntry {
                binding: index as u32,
                resource: bound.buffer.as_entire_binding(),
            });
        }

        let limits = context.device.limits();
        let (groups_x, groups_y) = workgroup_grid(
            len,
            self.kernel.workgroup_size(),
            limits.max_compute_workgroups_per_dimension,
        )?;

        let (command_buffer, scope_error) = context.capture_errors(|device| {
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("kernel_bind_group"),
                layout: &self.kernel.bind_group_layout,
                entries: &entries,
            });
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kernel_encoder"),
            });
            {
                let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("kernel_pass"),
                    timestamp_writes: None,
                });
                cpass.set_pipeline(&self.kernel.pipeline);
                cpass.set_bind_group(0, &bind_group, &[]);
                cpass.dispatch_workgroups(groups_x, groups_y, 1);
            }
            encoder.finish()
        });
        if let Some(e) = scope_error {
            return Err(Error::ExecutionFailed(format!(
                "recording `{}`: {e}",
                self.kernel.entry_point()
            )));
        }
        debug!(
            "dispatching `{}` over {len} elements as {groups_x}x{groups_y} workgroups",
            self.kernel.entry_point()
        );

        let start = Instant::now();
        context.queue.submit([command_buffer]);
        context
            .device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| Error::ExecutionFailed(format!("waiting for `{}`: {e}", self.kernel.entry_point())))?;
        Ok(start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_ranges_use_one_row() {
        assert_eq!(workgroup_grid(1, 64, 65_535).unwrap(), (1, 1));
        assert_eq!(workgroup_grid(64, 64, 65_535).unwrap(), (1, 1));
        assert_eq!(workgroup_grid(65, 64, 65_535).unwrap(), (2, 1));
        assert_eq!(workgroup_grid(1_000_000, 64, 65_535).unwrap(), (15_625, 1));
    }

    #[test]
    fn large_ranges_spill_into_y() {
        // 65_535 * 64 + 1 elements need one more group than fits in x.
        let len = 65_535 * 64 + 1;
        let (x, y) = workgroup_grid(len, 64, 65_535).unwrap();
        assert_eq!((x, y), (65_535, 2));
        assert!(u64::from(x) * u64::from(y) * 64 >= len as u64);
    }

    #[test]
    fn grid_always_covers_the_range() {
        for len in [1usize, 63, 64, 65, 1_000, 4_096, 100_000, 9_999_999] {
            let (x, y) = workgroup_grid(len, 64, 1_024).unwrap();
            assert!(x <= 1_024 && y <= 1_024);
            assert!(u64::from(x) * u64::from(y) * 64 >= len as u64, "len {len}");
        }
    }

    #[test]
    fn oversized_ranges_are_rejected() {
        assert!(workgroup_grid(5 * 5 * 2 + 1, 2, 5).is_err());
        assert!(workgroup_grid(10, 0, 5).is_err());
    }
}
