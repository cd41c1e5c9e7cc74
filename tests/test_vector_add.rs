// tests/test_vector_add.rs — end-to-end runs against a real adapter.
//
// Everything here needs a GPU, so the tests are ignored by default. Run them
// with:
//   cargo test --test test_vector_add -- --include-ignored
// Set GPU_VECTOR_ADD_SOFTWARE=1 to let a software adapter (llvmpipe) stand
// in for the GPU on headless machines.

use gpu_vector_add::{
    generate_inputs, Access, BufferConfig, BufferContents, CompiledKernel, ContextConfig,
    Dispatch, Error, GpuBuffer, GpuContext, KernelArg, KernelSpec, ResourceKind, RunConfig,
    VectorAddRunner,
};
use rand::Rng;

fn config() -> RunConfig {
    let allow_software = std::env::var_os("GPU_VECTOR_ADD_SOFTWARE").is_some();
    RunConfig {
        context: ContextConfig {
            allow_software,
            ..ContextConfig::default()
        },
        ..RunConfig::default()
    }
}

fn runner() -> VectorAddRunner {
    VectorAddRunner::new(config()).expect("should acquire a GPU device")
}

// ===== Scenarios =====

#[test]
#[ignore = "requires a GPU adapter"]
fn single_element() {
    let report = runner().run(1).unwrap();
    assert_eq!(report.result, vec![3.0]);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn five_elements() {
    let report = runner().run(5).unwrap();
    assert_eq!(report.result, vec![3.0, 6.0, 9.0, 12.0, 15.0]);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn one_million_elements() {
    let report = runner().run(1_000_000).unwrap();
    assert_eq!(report.result.len(), 1_000_000);
    assert_eq!(report.result[999_999], 3_000_000.0);
    let (a, b) = generate_inputs(1_000_000);
    report.verify(&a, &b).unwrap();
}

#[test]
#[ignore = "requires a GPU adapter"]
fn lengths_off_the_workgroup_boundary() {
    let runner = runner();
    let mut rng = rand::thread_rng();
    let mut lengths = vec![63, 64, 65, 127, 129];
    lengths.extend((0..5).map(|_| rng.gen_range(1..200_000)));
    for n in lengths {
        let report = runner.run(n).unwrap();
        let (a, b) = generate_inputs(n);
        report.verify(&a, &b).unwrap_or_else(|e| panic!("n = {n}: {e}"));
    }
}

#[test]
#[ignore = "requires a GPU adapter"]
fn repeated_runs_are_identical() {
    let runner = runner();
    let first = runner.run(10_000).unwrap();
    let second = runner.run(10_000).unwrap();
    assert_eq!(first.result, second.result);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn caller_supplied_inputs() {
    let mut rng = rand::thread_rng();
    let a: Vec<f32> = (0..4_096).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let b: Vec<f32> = (0..4_096).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let report = runner().run_inputs(&a, &b).unwrap();
    report.verify(&a, &b).unwrap();
}

// ===== Validation =====

#[test]
#[ignore = "requires a GPU adapter"]
fn zero_length_is_rejected() {
    let runner = runner();
    assert!(matches!(runner.run(0), Err(Error::InvalidLength { len: 0 })));
    assert!(matches!(
        runner.run_inputs(&[], &[]),
        Err(Error::InvalidLength { len: 0 })
    ));
    assert_eq!(runner.context().tracker().live(ResourceKind::Buffer), 0);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn oversized_vectors_fail_before_allocating() {
    let runner = runner();
    let max = runner.context().max_binding_bytes();
    let too_many = (max / 4 + 1) as usize;
    let err = GpuBuffer::<f32>::create(
        runner.context(),
        "too_big",
        BufferContents::Len(too_many),
        BufferConfig::write_only(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::ResourceAllocationFailed { .. }), "{err}");
    assert_eq!(runner.context().tracker().live(ResourceKind::Buffer), 0);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn malformed_kernel_reports_diagnostics() {
    let mut config = config();
    config.kernel.body = "result[i] = a[i] + missing[i];".into();
    let runner = VectorAddRunner::new(config).unwrap();
    match runner.run(8) {
        Err(Error::KernelCompilationFailed {
            entry_point,
            diagnostics,
        }) => {
            assert_eq!(entry_point, "vector_add");
            assert!(!diagnostics.is_empty());
        }
        other => panic!("expected a compilation failure, got {other:?}"),
    }
}

#[test]
#[ignore = "requires a GPU adapter"]
fn read_only_buffer_cannot_be_bound_as_output() {
    let ctx = GpuContext::new_blocking_with(&config().context).unwrap();
    let kernel = CompiledKernel::compile(&ctx, &KernelSpec::vector_add()).unwrap();
    let data = [1.0f32; 4];
    let input = GpuBuffer::create(&ctx, "in", BufferContents::Data(&data[..]), BufferConfig::read_only()).unwrap();
    let mut dispatch = Dispatch::new(&kernel);
    assert!(dispatch.bind(2, &input).is_err());
    assert!(dispatch.bind(3, &input).is_err());
}

#[test]
#[ignore = "requires a GPU adapter"]
fn unbound_arguments_fail_execution() {
    let ctx = GpuContext::new_blocking_with(&config().context).unwrap();
    let kernel = CompiledKernel::compile(&ctx, &KernelSpec::vector_add()).unwrap();
    let data = [1.0f32; 4];
    let a = GpuBuffer::create(&ctx, "a", BufferContents::Data(&data[..]), BufferConfig::read_only()).unwrap();
    let mut dispatch = Dispatch::new(&kernel);
    dispatch.bind(0, &a).unwrap();
    assert!(matches!(
        dispatch.execute_blocking(&ctx, 4),
        Err(Error::ExecutionFailed(_))
    ));
}

#[test]
#[ignore = "requires a GPU adapter"]
fn custom_kernel_runs_through_the_same_path() {
    let ctx = GpuContext::new_blocking_with(&config().context).unwrap();
    let spec = KernelSpec {
        entry_point: "scale".into(),
        args: vec![
            KernelArg::new("input", Access::ReadOnly),
            KernelArg::new("output", Access::WriteOnly),
        ],
        body: "output[i] = input[i] * 3.0;".into(),
        workgroup_size: 32,
    };
    let kernel = CompiledKernel::compile(&ctx, &spec).unwrap();
    let data: Vec<f32> = (0..100).map(|i| i as f32).collect();
    let input = GpuBuffer::create(&ctx, "input", BufferContents::Data(&data[..]), BufferConfig::read_only()).unwrap();
    let output = GpuBuffer::<f32>::create(&ctx, "output", BufferContents::Len(100), BufferConfig::write_only()).unwrap();
    let mut dispatch = Dispatch::new(&kernel);
    dispatch.bind(0, &input).unwrap().bind(1, &output).unwrap();
    dispatch.execute_blocking(&ctx, 100).unwrap();
    let result = output.read_to_vec(&ctx).unwrap();
    assert_eq!(result[99], 297.0);
}

// ===== Resource release =====

#[test]
#[ignore = "requires a GPU adapter"]
fn nothing_left_allocated_after_success() {
    let runner = runner();
    let tracker = runner.context().tracker().clone();
    runner.run(1_000).unwrap();
    assert_eq!(tracker.live(ResourceKind::Buffer), 0);
    assert_eq!(tracker.live(ResourceKind::Kernel), 0);
    assert_eq!(tracker.live(ResourceKind::Program), 0);
    assert_eq!(tracker.live(ResourceKind::Queue), 1);
    assert_eq!(tracker.live(ResourceKind::Context), 1);

    drop(runner);
    assert_eq!(tracker.total_live(), 0);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn nothing_left_allocated_after_failure() {
    let mut config = config();
    config.kernel.body = "this is not wgsl".into();
    let runner = VectorAddRunner::new(config).unwrap();
    let tracker = runner.context().tracker().clone();
    assert!(runner.run(1_000).is_err());
    assert_eq!(tracker.live(ResourceKind::Buffer), 0);
    assert_eq!(tracker.live(ResourceKind::Program), 0);
    assert_eq!(tracker.live(ResourceKind::Kernel), 0);

    drop(runner);
    assert_eq!(tracker.total_live(), 0);
}
