//! Element-wise vector addition on the GPU.
//!
//! [`VectorAddRunner`] performs the whole sequence for one vector length:
//! generate the inputs, upload them, compile the kernel, dispatch it once,
//! wait, and read the result back. Every device object created for a run
//! is owned by a local of [`VectorAddRunner::run_inputs`], so all of them
//! are released when the run returns, whether it succeeded or not.

use std::time::Duration;

use log::debug;

use crate::buffer::{BufferConfig, BufferContents, GpuBuffer};
use crate::compute::Dispatch;
use crate::context::{AdapterSummary, ContextConfig, GpuContext};
use crate::error::{Error, Result};
use crate::kernel::{CompiledKernel, KernelSpec};

/// Vector length used when none is given.
pub const DEFAULT_LEN: usize = 1_000_000;

/// `A[i] = i + 1` and `B[i] = 2 * (i + 1)` for `i` in `[0, n)`.
pub fn generate_inputs(n: usize) -> (Vec<f32>, Vec<f32>) {
    let a: Vec<f32> = (1..=n).map(|i| i as f32).collect();
    let b: Vec<f32> = (1..=n).map(|i| i as f32 * 2.0).collect();
    (a, b)
}

/// Host reference implementation of the kernel.
pub fn cpu_vector_add(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

/// Everything a runner needs besides the vector length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunConfig {
    pub context: ContextConfig,
    /// Must take two read arguments followed by one written argument.
    pub kernel: KernelSpec,
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub result: Vec<f32>,
    /// Submission-to-completion time of the kernel dispatch.
    pub kernel_time: Duration,
    pub adapter: AdapterSummary,
}

impl RunReport {
    pub fn kernel_millis(&self) -> f64 {
        self.kernel_time.as_secs_f64() * 1_000.0
    }

    /// Check `result[i] == a[i] + b[i]` for every element.
    pub fn verify(&self, a: &[f32], b: &[f32]) -> Result<()> {
        if self.result.len() != a.len() || a.len() != b.len() {
            return Err(Error::ExecutionFailed(format!(
                "length mismatch: result {}, a {}, b {}",
                self.result.len(),
                a.len(),
                b.len()
            )));
        }
        let mismatch = self
            .result
            .iter()
            .zip(cpu_vector_add(a, b))
            .position(|(gpu, cpu)| *gpu != cpu);
        match mismatch {
            Some(i) => Err(Error::ExecutionFailed(format!(
                "result[{i}] = {} but a[{i}] + b[{i}] = {}",
                self.result[i],
                a[i] + b[i]
            ))),
            None => Ok(()),
        }
    }
}

/// Owns a GPU context and runs the vector-add kernel on it.
#[derive(Debug)]
pub struct VectorAddRunner {
    context: GpuContext,
    kernel: KernelSpec,
}

impl VectorAddRunner {
    /// Acquire a context according to `config`.
    pub fn new(config: RunConfig) -> Result<Self> {
        let context = GpuContext::new_blocking_with(&config.context)?;
        Ok(Self::with_context(context, config.kernel))
    }

    /// Run on an existing context.
    pub fn with_context(context: GpuContext, kernel: KernelSpec) -> Self {
        Self { context, kernel }
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    pub fn into_context(self) -> GpuContext {
        self.context
    }

    /// Add the generated inputs of length `n` on the GPU.
    pub fn run(&self, n: usize) -> Result<RunReport> {
        if n == 0 {
            return Err(Error::InvalidLength { len: n });
        }
        let (a, b) = generate_inputs(n);
        self.run_inputs(&a, &b)
    }

    /// Add caller-supplied inputs of equal, non-zero length on the GPU.
    pub fn run_inputs(&self, a: &[f32], b: &[f32]) -> Result<RunReport> {
        if a.len() != b.len() {
            return Err(Error::ExecutionFailed(format!(
                "input lengths differ: {} and {}",
                a.len(),
                b.len()
            )));
        }
        let n = a.len();
        if n == 0 {
            return Err(Error::InvalidLength { len: n });
        }
        let ctx = &self.context;

        let input = BufferConfig::read_only().with_host_aliasing(true);
        let buffer_a = GpuBuffer::create(ctx, "vector_a", BufferContents::Data(a), input)?;
        let buffer_b = GpuBuffer::create(ctx, "vector_b", BufferContents::Data(b), input)?;
        let buffer_result =
            GpuBuffer::<f32>::create(ctx, "vector_result", BufferContents::Len(n), BufferConfig::write_only())?;

        let kernel = CompiledKernel::compile(ctx, &self.kernel)?;
        if kernel.args().len() != 3 {
            return Err(Error::InvalidKernel(format!(
                "`{}` takes {} arguments, vector addition binds 3",
                kernel.entry_point(),
                kernel.args().len()
            )));
        }

        let mut dispatch = Dispatch::new(&kernel);
        dispatch
            .bind(0, &buffer_a)?
            .bind(1, &buffer_b)?
            .bind(2, &buffer_result)?;
        let kernel_time = dispatch.execute_blocking(ctx, n)?;
        debug!("`{}` over {n} elements took {kernel_time:?}", kernel.entry_point());

        let result = buffer_result.read_to_vec(ctx)?;
        Ok(RunReport {
            result,
            kernel_time,
            adapter: ctx.summary.clone(),
        })
    }
}

/// Acquire a device, add the generated vectors of length `n`, and release
/// everything before returning.
pub fn run_vector_add(n: usize) -> Result<RunReport> {
    if n == 0 {
        return Err(Error::InvalidLength { len: n });
    }
    VectorAddRunner::new(RunConfig::default())?.run(n)
}
