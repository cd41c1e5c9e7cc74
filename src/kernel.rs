//! Element-wise kernels described as data and compiled to compute pipelines.
//!
//! A [`KernelSpec`] names an entry point, an ordered list of buffer
//! arguments and a body. Rendering produces a WGSL module in which argument
//! `k` is bound at `@binding(k)`, every argument is an `array<f32>`, and the
//! body runs once per global index with that index available as `i`.
//! Invocations past the length of the first argument return before the
//! body, so the body never needs its own bounds check.

use std::borrow::Cow;
use std::num::NonZeroU64;

use log::{debug, warn};
use wgpu::{BindGroupLayout, ComputePipeline, ShaderModule, ShaderModuleDescriptor, ShaderSource};

use crate::buffer::Access;
use crate::error::{Diagnostic, Error, Result, Severity};
use crate::tracker::{ResourceGuard, ResourceKind};
use crate::GpuContext;

/// Names the rendered entry point declares for its own use.
const TEMPLATE_NAMES: [&str; 3] = ["i", "gid", "num_groups"];

/// Largest workgroup accepted; the downlevel limit on invocations.
pub const MAX_WORKGROUP_SIZE: u32 = 256;

/// One positional buffer argument of a kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArg {
    pub name: String,
    pub access: Access,
}

impl KernelArg {
    pub fn new(name: impl Into<String>, access: Access) -> Self {
        Self {
            name: name.into(),
            access,
        }
    }
}

/// Source-level description of an element-wise kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpec {
    pub entry_point: String,
    pub args: Vec<KernelArg>,
    /// WGSL statements executed for global index `i`.
    pub body: String,
    pub workgroup_size: u32,
}

impl KernelSpec {
    /// `result[i] = a[i] + b[i]` over two read-only inputs.
    pub fn vector_add() -> Self {
        Self {
            entry_point: "vector_add".into(),
            args: vec![
                KernelArg::new("a", Access::ReadOnly),
                KernelArg::new("b", Access::ReadOnly),
                KernelArg::new("result", Access::WriteOnly),
            ],
            body: "result[i] = a[i] + b[i];".into(),
            workgroup_size: 64,
        }
    }

    /// Check the spec before anything is sent to the compiler.
    pub fn validate(&self) -> Result<()> {
        if !is_identifier(&self.entry_point) {
            return Err(Error::InvalidKernel(format!(
                "entry point `{}` is not a valid identifier",
                self.entry_point
            )));
        }
        if self.args.is_empty() {
            return Err(Error::InvalidKernel("kernel takes no buffer arguments".into()));
        }
        let mut seen: Vec<&str> = vec![self.entry_point.as_str()];
        for arg in &self.args {
            if !is_identifier(&arg.name) {
                return Err(Error::InvalidKernel(format!(
                    "argument `{}` is not a valid identifier",
                    arg.name
                )));
            }
            if TEMPLATE_NAMES.contains(&arg.name.as_str()) || seen.contains(&arg.name.as_str()) {
                return Err(Error::InvalidKernel(format!(
                    "argument name `{}` is already in use",
                    arg.name
                )));
            }
            seen.push(&arg.name);
        }
        if self.body.trim().is_empty() {
            return Err(Error::InvalidKernel("kernel body is empty".into()));
        }
        if !(1..=MAX_WORKGROUP_SIZE).contains(&self.workgroup_size) {
            return Err(Error::InvalidKernel(format!(
                "workgroup size {} outside 1..={MAX_WORKGROUP_SIZE}",
                self.workgroup_size
            )));
        }
        Ok(())
    }

    /// Render the WGSL module.
    pub fn to_wgsl(&self) -> String {
        let mut src = String::new();
        for (binding, arg) in self.args.iter().enumerate() {
            let mode = if arg.access.writable() { "read_write" } else { "read" };
            src.push_str(&format!(
                "@group(0) @binding({binding})\nvar<storage, {mode}> {}: array<f32>;\n",
                arg.name
            ));
        }
        let wg = self.workgroup_size;
        src.push_str(&format!(
            "\n@compute @workgroup_size({wg})\n\
             fn {}(\n    \
             @builtin(global_invocation_id) gid: vec3<u32>,\n    \
             @builtin(num_workgroups) num_groups: vec3<u32>,\n\
             ) {{\n    \
             let i = gid.x + gid.y * num_groups.x * {wg}u;\n    \
             if (i >= arrayLength(&{})) {{\n        \
             return;\n    \
             }}\n",
            self.entry_point, self.args[0].name
        ));
        for line in self.body.lines() {
            src.push_str("    ");
            src.push_str(line);
            src.push('\n');
        }
        src.push_str("}\n");
        src
    }
}

impl Default for KernelSpec {
    fn default() -> Self {
        Self::vector_add()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name != "_"
        && !name.starts_with("__")
}

/// A kernel compiled for one device: its program (shader module), the
/// argument layout, and the compute pipeline for the entry point.
///
/// The pipeline is declared, and therefore dropped, before the module.
pub struct CompiledKernel {
    pub(crate) pipeline: ComputePipeline,
    _kernel_guard: ResourceGuard,
    pub(crate) bind_group_layout: BindGroupLayout,
    _module: ShaderModule,
    _program_guard: ResourceGuard,
    spec: KernelSpec,
}

impl CompiledKernel {
    /// Compile `spec` on the context's device.
    ///
    /// Compiler messages are collected as [`Diagnostic`]s; warnings are
    /// logged and any error fails with [`Error::KernelCompilationFailed`].
    pub fn compile(context: &GpuContext, spec: &KernelSpec) -> Result<Self> {
        spec.validate()?;
        let source = spec.to_wgsl();
        debug!("compiling kernel `{}`:\n{source}", spec.entry_point);

        let (module, scope_error) = context.capture_errors(|device| {
            device.create_shader_module(ShaderModuleDescriptor {
                label: Some(spec.entry_point.as_str()),
                source: ShaderSource::Wgsl(Cow::Owned(source)),
            })
        });
        let program_guard = context.tracker().acquire(ResourceKind::Program);

        let info = pollster::block_on(module.get_compilation_info());
        let mut diagnostics: Vec<Diagnostic> = info.messages.iter().map(to_diagnostic).collect();
        for d in diagnostics.iter().filter(|d| d.severity == Severity::Warning) {
            warn!("kernel `{}`: {d}", spec.entry_point);
        }
        let has_error = diagnostics.iter().any(|d| d.severity == Severity::Error);
        if scope_error.is_some() || has_error {
            if let (Some(e), false) = (scope_error, has_error) {
                diagnostics.push(scope_diagnostic(&e));
            }
            return Err(Error::KernelCompilationFailed {
                entry_point: spec.entry_point.clone(),
                diagnostics,
            });
        }

        let element_size = NonZeroU64::new(std::mem::size_of::<f32>() as u64);
        let entries: Vec<wgpu::BindGroupLayoutEntry> = spec
            .args
            .iter()
            .enumerate()
            .map(|(binding, arg)| wgpu::BindGroupLayoutEntry {
                binding: binding as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: !arg.access.writable(),
                    },
                    has_dynamic_offset: false,
                    min_binding_size: element_size,
                },
                count: None,
            })
            .collect();

        let ((bind_group_layout, pipeline), scope_error) = context.capture_errors(|device| {
            let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("kernel_bind_group_layout"),
                entries: &entries,
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("kernel_pipeline_layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(spec.entry_point.as_str()),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(spec.entry_point.as_str()),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
            (bind_group_layout, pipeline)
        });
        let kernel_guard = context.tracker().acquire(ResourceKind::Kernel);
        if let Some(e) = scope_error {
            return Err(Error::KernelCompilationFailed {
                entry_point: spec.entry_point.clone(),
                diagnostics: vec![scope_diagnostic(&e)],
            });
        }

        Ok(Self {
            pipeline,
            _kernel_guard: kernel_guard,
            bind_group_layout,
            _module: module,
            _program_guard: program_guard,
            spec: spec.clone(),
        })
    }

    pub fn spec(&self) -> &KernelSpec {
        &self.spec
    }

    pub fn args(&self) -> &[KernelArg] {
        &self.spec.args
    }

    pub fn entry_point(&self) -> &str {
        &self.spec.entry_point
    }

    pub fn workgroup_size(&self) -> u32 {
        self.spec.workgroup_size
    }
}

impl std::fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledKernel").field("spec", &self.spec).finish()
    }
}

fn to_diagnostic(message: &wgpu::CompilationMessage) -> Diagnostic {
    let severity = match message.message_type {
        wgpu::CompilationMessageType::Error => Severity::Error,
        wgpu::CompilationMessageType::Warning => Severity::Warning,
        _ => Severity::Info,
    };
    Diagnostic {
        severity,
        message: message.message.clone(),
        line: message.location.as_ref().map(|l| l.line_number),
        column: message.location.as_ref().map(|l| l.line_position),
    }
}

fn scope_diagnostic(error: &wgpu::Error) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        message: error.to_string(),
        line: None,
        column: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_add_renders_positional_bindings() {
        let wgsl = KernelSpec::vector_add().to_wgsl();
        assert!(wgsl.contains("@group(0) @binding(0)\nvar<storage, read> a: array<f32>;"));
        assert!(wgsl.contains("@group(0) @binding(1)\nvar<storage, read> b: array<f32>;"));
        assert!(wgsl.contains("@group(0) @binding(2)\nvar<storage, read_write> result: array<f32>;"));
        assert!(wgsl.contains("@compute @workgroup_size(64)\nfn vector_add("));
        assert!(wgsl.contains("let i = gid.x + gid.y * num_groups.x * 64u;"));
        assert!(wgsl.contains("if (i >= arrayLength(&a)) {"));
        assert!(wgsl.contains("    result[i] = a[i] + b[i];\n}"));
    }

    #[test]
    fn multi_line_bodies_are_indented() {
        let spec = KernelSpec {
            body: "let s = a[i] + b[i];\nresult[i] = s;".into(),
            ..KernelSpec::vector_add()
        };
        let wgsl = spec.to_wgsl();
        assert!(wgsl.contains("    let s = a[i] + b[i];\n    result[i] = s;\n}"));
    }

    #[test]
    fn default_spec_is_valid() {
        assert!(KernelSpec::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_entry_points() {
        for name in ["", "1add", "vector-add", "_", "__add"] {
            let spec = KernelSpec {
                entry_point: name.into(),
                ..KernelSpec::vector_add()
            };
            assert!(
                matches!(spec.validate(), Err(Error::InvalidKernel(_))),
                "accepted `{name}`"
            );
        }
    }

    #[test]
    fn rejects_duplicate_and_reserved_argument_names() {
        let mut spec = KernelSpec::vector_add();
        spec.args[1].name = "a".into();
        assert!(spec.validate().is_err());

        let mut spec = KernelSpec::vector_add();
        spec.args[0].name = "gid".into();
        assert!(spec.validate().is_err());

        let mut spec = KernelSpec::vector_add();
        spec.args[2].name = "vector_add".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_empty_argument_list_and_body() {
        let spec = KernelSpec {
            args: vec![],
            ..KernelSpec::vector_add()
        };
        assert!(spec.validate().is_err());
        let spec = KernelSpec {
            body: "  \n".into(),
            ..KernelSpec::vector_add()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn workgroup_size_bounds() {
        for (size, ok) in [(0, false), (1, true), (256, true), (257, false)] {
            let spec = KernelSpec {
                workgroup_size: size,
                ..KernelSpec::vector_add()
            };
            assert_eq!(spec.validate().is_ok(), ok, "workgroup size {size}");
        }
    }
}
