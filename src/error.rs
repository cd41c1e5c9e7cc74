//! Error types shared by every stage of a GPU run.
//!
//! Each variant corresponds to one step of the run that can fail. None of
//! them are recovered locally: an error aborts the run and every resource
//! acquired up to that point is released as the owning values go out of
//! scope.

use std::fmt;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Severity of a compiler message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// One message reported by the shader compiler or by pipeline validation.
///
/// `line` and `column` are 1-based and refer to the rendered WGSL text, not
/// to the kernel body that was supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "{tag} at {line}:{column}: {}", self.message),
            (Some(line), None) => write!(f, "{tag} at line {line}: {}", self.message),
            _ => write!(f, "{tag}: {}", self.message),
        }
    }
}

/// Errors that can occur while acquiring a device or running a kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// No backend exposed a single adapter.
    #[error("no compute platform available: no backend exposed any adapter")]
    PlatformUnavailable,

    /// The selected platform has adapters, but none of them is a GPU.
    #[error("no GPU device on platform {platform} ({adapters} non-GPU adapter(s) found)")]
    DeviceUnavailable { platform: String, adapters: usize },

    /// The adapter cannot run compute shaders.
    #[error("adapter {name} does not support compute shaders")]
    UnsupportedDevice { name: String },

    /// The logical device request was rejected by the driver.
    #[error("failed to create GPU device: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    /// The kernel spec itself is malformed; nothing was sent to the compiler.
    #[error("invalid kernel: {0}")]
    InvalidKernel(String),

    /// The compiler or pipeline validation rejected the kernel.
    #[error("kernel `{entry_point}` failed to compile:{}", render_diagnostics(.diagnostics))]
    KernelCompilationFailed {
        entry_point: String,
        diagnostics: Vec<Diagnostic>,
    },

    /// A device buffer could not be created.
    #[error("failed to allocate buffer `{label}` ({bytes} bytes): {reason}")]
    ResourceAllocationFailed {
        label: String,
        bytes: u64,
        reason: String,
    },

    /// Submission, completion wait or read-back failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Vector length outside the supported range.
    #[error("invalid vector length {len}: must be at least 1")]
    InvalidLength { len: usize },
}

impl Error {
    /// Name of the step that failed, for user-facing diagnostics.
    pub fn step(&self) -> &'static str {
        match self {
            Error::PlatformUnavailable => "platform lookup",
            Error::DeviceUnavailable { .. }
            | Error::UnsupportedDevice { .. }
            | Error::DeviceRequest(_) => "device lookup",
            Error::InvalidKernel(_) | Error::KernelCompilationFailed { .. } => "compilation",
            Error::ResourceAllocationFailed { .. } => "allocation",
            Error::ExecutionFailed(_) => "execution",
            Error::InvalidLength { .. } => "validation",
        }
    }
}

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    if diagnostics.is_empty() {
        return " no diagnostics reported".to_string();
    }
    diagnostics.iter().map(|d| format!("\n  {d}")).collect()
}
