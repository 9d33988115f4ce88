//! # SchedSim Host Daemon
//!
//! Main entry point for the scheduler simulation.

use schedsimd::{HostRuntime, HostRuntimeConfig};
use std::env;
use std::path::PathBuf;
use std::process;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();

    let config = parse_args(&args).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        print_usage(&args[0]);
        process::exit(1);
    });

    let mut runtime = HostRuntime::new(config).unwrap_or_else(|e| {
        eprintln!("Failed to create runtime: {}", e);
        process::exit(1);
    });

    if let Err(e) = runtime.run() {
        eprintln!("Runtime error: {}", e);
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<HostRuntimeConfig, String> {
    let mut config = HostRuntimeConfig::default();
    let mut i = 1;

    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--config" | "-c" => {
                config.config_path = Some(PathBuf::from(value(args, &mut i, flag)?));
            }
            "--units" | "-n" => {
                config.overrides.units = Some(number(args, &mut i, flag)?);
            }
            "--slice-ms" => {
                config.overrides.slice_ms = Some(number(args, &mut i, flag)?);
            }
            "--io-ms" => {
                config.overrides.io_ms = Some(number(args, &mut i, flag)?);
            }
            "--work-ms" => {
                config.overrides.work_ms = Some(number(args, &mut i, flag)?);
            }
            "--max-iterations" => {
                config.overrides.max_iterations = Some(number(args, &mut i, flag)?);
            }
            "--seed" => {
                config.overrides.seed = Some(number(args, &mut i, flag)?);
            }
            "--state-dir" => {
                config.overrides.state_dir = Some(PathBuf::from(value(args, &mut i, flag)?));
            }
            "--duration-ms" => {
                config.duration_ms = Some(number(args, &mut i, flag)?);
            }
            "--help" | "-h" => {
                print_usage(&args[0]);
                process::exit(0);
            }
            other => {
                return Err(format!("Unknown option: {}", other));
            }
        }
        i += 1;
    }

    Ok(config)
}

fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("Missing value for {}", flag))
}

fn number<T: std::str::FromStr>(args: &[String], i: &mut usize, flag: &str) -> Result<T, String> {
    let raw = value(args, i, flag)?;
    raw.parse()
        .map_err(|_| format!("Invalid {} value: {}", flag, raw))
}

fn print_usage(program: &str) {
    eprintln!("Usage: {} [OPTIONS]", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <FILE>      JSON simulation config");
    eprintln!("  -n, --units <N>          Number of managed units (default 3)");
    eprintln!("  --slice-ms <MS>          Time-slice interval (default 1000)");
    eprintln!("  --io-ms <MS>             I/O completion interval (default 3000)");
    eprintln!("  --work-ms <MS>           Duration of one work iteration (default 1000)");
    eprintln!("  --max-iterations <N>     Iterations per unit (default 10)");
    eprintln!("  --seed <N>               Seed for the blocking decisions");
    eprintln!("  --state-dir <DIR>        Directory for kernel_pid and pc_state_* files");
    eprintln!("  --duration-ms <MS>       Stop after this long even if units remain");
    eprintln!("  -h, --help               Show this help message");
    eprintln!();
    eprintln!("Log verbosity follows RUST_LOG (default: info).");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  {} --units 4 --seed 42", program);
    eprintln!(
        "  RUST_LOG=kernel=debug {} --slice-ms 100 --io-ms 300 --work-ms 100",
        program
    );
}
