use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "shardpool workspace automation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pool benchmarks and compare them with the system allocator
    Bench {
        /// Run quickly (lower sample size/time)
        #[arg(long, default_value_t = false)]
        quick: bool,

        /// Generate report only (skip running benchmarks)
        #[arg(long, default_value_t = false)]
        report_only: bool,
    },
}

const BENCHES: &[&str] = &["pool_benchmark", "thread_pool_benchmark"];

/// Contender prefixes; each has a `std_box` counterpart in the same group.
const CONTENDERS: &[&str] = &["thread_pool", "pool"];

#[derive(Deserialize)]
struct Estimate {
    point_estimate: f64,
}

#[derive(Deserialize)]
struct Estimates {
    mean: Estimate,
}

#[derive(Deserialize)]
struct BenchmarkInfo {
    throughput: Option<Throughput>,
}

#[derive(Deserialize)]
enum Throughput {
    Elements(u64),
    Bytes(u64),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Bench { quick, report_only } => {
            if !report_only {
                run_benchmarks(quick)?;
            }
            generate_report()?;
        }
    }

    Ok(())
}

fn run_benchmarks(quick: bool) -> Result<()> {
    for bench in BENCHES {
        println!("\n>>> Running {bench}");
        let start = Instant::now();

        let mut cmd = Command::new("cargo");
        cmd.args(["bench", "--bench", bench, "--"]);
        if quick {
            cmd.args(["--measurement-time", "0.1", "--noplot", "--sample-size", "10"]);
        }

        let status = cmd
            .status()
            .with_context(|| format!("failed to run bench {bench}"))?;
        if !status.success() {
            anyhow::bail!("benchmark {bench} failed");
        }
        println!("Finished {bench} in {:.2?}", start.elapsed());
    }
    Ok(())
}

fn generate_report() -> Result<()> {
    println!("\n>>> Generating Report...");
    let criterion_dir = Path::new("target/criterion");
    if !criterion_dir.exists() {
        eprintln!("No criterion output found at {}", criterion_dir.display());
        return Ok(());
    }

    // benchmark id -> ops per second
    let mut results = BTreeMap::new();
    collect_results(criterion_dir, criterion_dir, &mut results)?;

    let report_path = Path::new("benchmark_results/report.md");
    if let Some(parent) = report_path.parent() {
        fs::create_dir_all(parent)?;
    }

    use std::fmt::Write;
    let mut out = String::new();
    writeln!(out, "# Pool Benchmark Report\n")?;
    writeln!(out, "| Benchmark | Ops/s | std_box (Ops/s) | vs std_box |")?;
    writeln!(out, "|---|---|---|---|")?;

    for (id, ops) in &results {
        let Some(baseline_id) = baseline_of(id) else {
            continue;
        };
        match results.get(&baseline_id) {
            Some(base) => writeln!(
                out,
                "| {id} | {} | {} | **{:.2}x** |",
                format_ops(*ops),
                format_ops(*base),
                ops / base
            )?,
            None => writeln!(out, "| {id} | {} | N/A | - |", format_ops(*ops))?,
        }
    }

    fs::write(report_path, out)
        .with_context(|| format!("failed to write {}", report_path.display()))?;
    println!("Report written to {}", report_path.display());
    Ok(())
}

/// `pool_alloc_free/pool/64` -> `pool_alloc_free/std_box/64`. `None` for ids
/// that are not a pool contender.
fn baseline_of(id: &str) -> Option<String> {
    let mut parts: Vec<String> = id.split('/').map(str::to_owned).collect();
    let mut swapped = false;
    for part in parts.iter_mut().skip(1) {
        if let Some(prefix) = CONTENDERS.iter().find(|p| part.starts_with(**p)) {
            *part = format!("std_box{}", &part[prefix.len()..]);
            swapped = true;
            break;
        }
    }
    swapped.then(|| parts.join("/"))
}

fn format_ops(ops: f64) -> String {
    if ops > 1_000_000.0 {
        format!("{:.2}M", ops / 1_000_000.0)
    } else if ops > 1_000.0 {
        format!("{:.2}K", ops / 1_000.0)
    } else {
        format!("{ops:.0}")
    }
}

/// Walks `dir` for `<id>/new/estimates.json`.
fn collect_results(root: &Path, dir: &Path, results: &mut BTreeMap<String, f64>) -> Result<()> {
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if !path.is_dir() || path.file_name().is_some_and(|n| n == "report") {
            continue;
        }
        if path.file_name().is_some_and(|n| n == "new") {
            let Some(bench_dir) = path.parent() else {
                continue;
            };
            if let Some(ops) = read_ops(&path)? {
                let id = bench_dir
                    .strip_prefix(root)?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                results.insert(id, ops);
            }
        } else {
            collect_results(root, &path, results)?;
        }
    }
    Ok(())
}

fn read_ops(new_dir: &Path) -> Result<Option<f64>> {
    let estimates_path = new_dir.join("estimates.json");
    let Ok(content) = fs::read_to_string(&estimates_path) else {
        return Ok(None);
    };
    let estimates: Estimates = serde_json::from_str(&content)
        .with_context(|| format!("bad estimates in {}", estimates_path.display()))?;
    let time_ns = estimates.mean.point_estimate;
    if time_ns <= 0.0 {
        return Ok(None);
    }

    let elements = fs::read_to_string(new_dir.join("benchmark.json"))
        .ok()
        .and_then(|c| serde_json::from_str::<BenchmarkInfo>(&c).ok())
        .and_then(|info| info.throughput)
        .map_or(1.0, |t| match t {
            Throughput::Elements(n) | Throughput::Bytes(n) => n as f64,
        });
    Ok(Some(elements * 1e9 / time_ns))
}
