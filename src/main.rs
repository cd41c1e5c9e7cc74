//! Adds two generated vectors on the GPU and reports the kernel time.
//!
//! ```sh
//! cargo run --release -- --len 1000000 --verify
//! ```
//!
//! Set `RUST_LOG=debug` to see adapter enumeration, the rendered kernel and
//! every buffer allocation.

use std::io::BufRead;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use gpu_vector_add::{generate_inputs, ContextConfig, RunConfig, VectorAddRunner, DEFAULT_LEN};

/// Element-wise vector addition on the GPU.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of elements in each vector.
    #[arg(short, long, default_value_t = DEFAULT_LEN)]
    len: usize,

    /// Compare the GPU result against the CPU reference.
    #[arg(long)]
    verify: bool,

    /// Accept CPU/software adapters when no GPU is present.
    #[arg(long)]
    allow_software: bool,

    /// Print every element of the result.
    #[arg(long)]
    print_result: bool,

    /// Wait for Enter before exiting.
    #[arg(long)]
    pause: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let code = match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{} failed: {e}", e.step());
            ExitCode::FAILURE
        }
    };

    if args.pause {
        let mut line = String::new();
        // Nothing to recover if stdin is closed; exit either way.
        let _ = std::io::stdin().lock().read_line(&mut line);
    }
    code
}

fn run(args: &Args) -> gpu_vector_add::Result<()> {
    let config = RunConfig {
        context: ContextConfig {
            allow_software: args.allow_software,
            ..ContextConfig::default()
        },
        ..RunConfig::default()
    };
    let runner = VectorAddRunner::new(config)?;
    let report = runner.run(args.len)?;
    println!(
        "Time taken for GPU vector addition: {} milliseconds",
        report.kernel_time.as_millis()
    );

    if args.verify {
        let (a, b) = generate_inputs(args.len);
        report.verify(&a, &b)?;
        println!("Verified {} elements against the CPU reference", report.result.len());
    }
    if args.print_result {
        println!("\nVector Addition Result:");
        for (i, value) in report.result.iter().enumerate() {
            println!("Element {i}: {value}");
        }
    }
    Ok(())
}
