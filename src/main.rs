//! Simulator entry point: CLI wiring and the run loop.

use std::path::Path;
use std::process;

use depot_sim::io::export::export_csv;
use depot_sim::scenario::Scenario;
use depot_sim::sim::StepOutput;

/// Parsed CLI arguments.
struct CliArgs {
    scenario_path: String,
    output: Option<String>,
    quiet: bool,
}

fn print_help() {
    eprintln!("depot-sim — schedule-based depot charging simulator");
    eprintln!();
    eprintln!("Usage: depot-sim --scenario <path> [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --scenario <path>   Scenario description (TOML)");
    eprintln!("  --output <path>     Export per-interval commands to CSV");
    eprintln!("  --quiet             Suppress the per-interval log");
    eprintln!("  --help              Show this help message");
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut scenario_path = None;
    let mut output = None;
    let mut quiet = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--scenario" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --scenario requires a path argument");
                    process::exit(1);
                }
                scenario_path = Some(args[i].clone());
            }
            "--output" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --output requires a path argument");
                    process::exit(1);
                }
                output = Some(args[i].clone());
            }
            "--quiet" => {
                quiet = true;
            }
            other => {
                eprintln!("error: unknown argument \"{other}\"");
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    let Some(scenario_path) = scenario_path else {
        eprintln!("error: --scenario is required");
        print_help();
        process::exit(1);
    };
    CliArgs {
        scenario_path,
        output,
        quiet,
    }
}

fn run(args: &CliArgs) -> Result<Vec<StepOutput>, depot_sim::error::SimError> {
    let scenario = Scenario::load(Path::new(&args.scenario_path))?;
    let n_intervals = scenario.params.n_intervals;
    let interval_hours = scenario.params.interval.num_seconds() as f64 / 3600.0;
    let (mut strategy, event_steps) = scenario.into_strategy()?;

    let mut results = Vec::with_capacity(n_intervals);
    for events in event_steps {
        let output = strategy.step(events)?;
        if !args.quiet {
            println!("{output}");
        }
        results.push(output);
    }

    let charged_kwh: f64 = results
        .iter()
        .flat_map(|r| r.commands.values())
        .filter(|&&p| p > 0.0)
        .sum::<f64>()
        * interval_hours;
    println!(
        "simulated {} intervals, {charged_kwh:.1} kWh delivered to vehicles",
        results.len()
    );
    Ok(results)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args();
    let results = match run(&args) {
        Ok(results) => results,
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(1);
        }
    };

    if let Some(output) = &args.output {
        if let Err(err) = export_csv(&results, Path::new(output)) {
            eprintln!("error: CSV export failed: {err}");
            process::exit(1);
        }
        println!("exported commands to {output}");
    }
}
