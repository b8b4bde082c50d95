//! tracejit - developer CLI for the trace optimizer and compilation manager
//!
//! # Usage
//!
//! ```bash
//! # Print the optimized trace (preamble and peeled loop)
//! tracejit opt loop.trace
//!
//! # Compile through the compilation manager and run on the reference backend
//! tracejit run loop.trace --args 0,0 --runs 3 --stats
//!
//! # Parse, lower and validate without optimizing
//! tracejit check loop.trace
//!
//! # Print a configuration preset as TOML
//! tracejit config --preset development
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use compiler::codegen::{ExecOutcome, TraceInterpreter};
use compiler::ir::dump::{dump_trace_with, GuardDetail};
use compiler::ir::lowering::{LoweredTrace, Lowering};
use compiler::ir::validation::validate_trace;
use compiler::ir::{IrKind, RuntimeValue, GcRef};
use compiler::{logging, optimize_trace, CompilationContext, CompilationManager, GuardAction, JitConfig};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "tracejit")]
#[command(version = "0.1.0")]
#[command(about = "tracejit - trace optimizer and compilation manager", long_about = None)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Optimize a trace file and print the result
    Opt {
        /// Path to the trace file
        file: PathBuf,

        /// Optimize without peeling a loop iteration
        #[arg(long)]
        no_unroll: bool,

        /// Print guard snapshots instead of fail args
        #[arg(long)]
        snapshots: bool,

        /// Show per-pass counters
        #[arg(long)]
        stats: bool,
    },

    /// Compile a trace and execute it on the reference backend
    Run {
        /// Path to the trace file
        file: PathBuf,

        /// Input values, comma separated (refs are addresses, 0 is null)
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        args: Vec<String>,

        /// How many times to enter the compiled code
        #[arg(long, default_value = "1")]
        runs: usize,

        /// Show compilation statistics
        #[arg(long)]
        stats: bool,

        /// Print statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Parse, lower and validate a trace file
    Check {
        /// Path to the trace file
        file: PathBuf,
    },

    /// Print a configuration preset as TOML
    Config {
        #[arg(long, value_enum, default_value = "default")]
        preset: Preset,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Preset {
    Default,
    Development,
    Production,
}

fn main() {
    let cli = Cli::parse();
    logging::init_with_level(logging::level_for_verbosity(cli.verbose));

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Opt {
            file,
            no_unroll,
            snapshots,
            stats,
        } => optimize_file(&file, config, no_unroll, snapshots, stats),
        Commands::Run {
            file,
            args,
            runs,
            stats,
            json,
        } => run_file(&file, config, &args, runs, stats, json),
        Commands::Check { file } => check_file(&file),
        Commands::Config { preset } => show_config(preset),
    });

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<JitConfig, String> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
            JitConfig::from_toml(&text).map_err(|e| format!("{}: {}", path.display(), e))?
        }
        None => JitConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn lower_file(file: &Path, context: &CompilationContext) -> Result<LoweredTrace, String> {
    let source = std::fs::read_to_string(file)
        .map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
    let parsed = parser::parse_trace_file(&source).map_err(|e| format!("{}: {}", file.display(), e))?;
    Lowering::new(context.ids().clone())
        .with_tokens(context.pseudo_tokens())
        .lower(&parsed)
        .map_err(|e| format!("{}: {}", file.display(), e))
}

fn optimize_file(file: &Path, config: JitConfig, no_unroll: bool, snapshots: bool, stats: bool) -> Result<(), String> {
    let context = CompilationContext::new(Default::default());
    let lowered = lower_file(file, &context)?;
    let mut optimizer = config.optimizer;
    if no_unroll {
        optimizer.unroll = false;
    }
    let optimized = optimize_trace(&lowered.trace, &optimizer, context.ids()).map_err(|e| e.to_string())?;

    let detail = if snapshots {
        GuardDetail::Snapshot
    } else {
        GuardDetail::FailArgs
    };
    print!("{}", dump_trace_with(&optimized.trace, detail));

    if stats {
        println!();
        println!(
            "{} ops in, {} ops out, {} removed",
            lowered.trace.len(),
            optimized.trace.len(),
            optimized.stats.ops_removed
        );
        let mut counters: Vec<_> = optimized.stats.stats.iter().collect();
        counters.sort();
        for (name, count) in counters {
            println!("  {:<28} {}", name, count);
        }
    }
    Ok(())
}

fn parse_input(kind: IrKind, text: &str) -> Result<RuntimeValue, String> {
    let text = text.trim();
    let bad = || format!("'{}' is not a valid {} input", text, kind);
    match kind {
        IrKind::Int => text.parse().map(RuntimeValue::Int).map_err(|_| bad()),
        IrKind::Float => text.parse().map(RuntimeValue::Float).map_err(|_| bad()),
        IrKind::Ref => {
            let address = match text.strip_prefix("0x") {
                Some(hex) => usize::from_str_radix(hex, 16),
                None => text.parse(),
            };
            address.map(|a| RuntimeValue::Ref(GcRef(a))).map_err(|_| bad())
        }
        IrKind::Void => Err(bad()),
    }
}

fn run_file(
    file: &Path,
    config: JitConfig,
    args: &[String],
    runs: usize,
    stats: bool,
    json: bool,
) -> Result<(), String> {
    let manager = CompilationManager::new(TraceInterpreter::new(config.backend), config);
    let lowered = lower_file(file, manager.context())?;

    let kinds: Vec<IrKind> = lowered.trace.inputargs.iter().map(|b| b.kind()).collect();
    if kinds.len() != args.len() {
        return Err(format!(
            "trace takes {} inputs, {} given",
            kinds.len(),
            args.len()
        ));
    }
    let inputs = kinds
        .iter()
        .zip(args)
        .map(|(kind, text)| parse_input(*kind, text))
        .collect::<Result<Vec<_>, _>>()?;

    let cell = manager
        .compile_loop(&lowered.trace)
        .map_err(|e| e.to_string())?;
    println!(
        "compiled loop #{} at {} ({} ops, {} guards)",
        cell.number, cell.entry, cell.operations, cell.guards
    );

    for run in 1..=runs {
        let outcome = manager
            .backend()
            .execute(cell.entry, &inputs)
            .map_err(|e| e.to_string())?;
        match outcome {
            ExecOutcome::Finished(Some(value)) => println!("run {}: finished with {}", run, value),
            ExecOutcome::Finished(None) => println!("run {}: finished", run),
            ExecOutcome::Exception(Some(value)) => println!("run {}: raised {}", run, value),
            ExecOutcome::Exception(None) => println!("run {}: raised", run),
            ExecOutcome::GuardFailed { guard, frame } => {
                let failure = manager
                    .deoptimize(&guard, &frame)
                    .map_err(|e| e.to_string())?;
                println!(
                    "run {}: {} failed (count {})",
                    run,
                    guard.id(),
                    failure.failures
                );
                for resumed in &failure.frames {
                    let values: Vec<String> = resumed.values.iter().map(|v| v.to_string()).collect();
                    println!("  resume at {}: [{}]", resumed.position, values.join(", "));
                }
                if let Some(exception) = failure.exception {
                    println!("  pending exception {}", exception);
                }
                if failure.action == GuardAction::CompileBridge {
                    // nothing records bridges here; the guard keeps deoptimizing
                    println!("  bridge requested");
                    manager.abandon_bridge(&guard);
                }
            }
        }
    }

    if json {
        let report = manager.statistics().to_json().map_err(|e| e.to_string())?;
        println!("{}", report);
    } else if stats {
        println!();
        println!("{}", manager.statistics().format());
    }
    Ok(())
}

fn check_file(file: &Path) -> Result<(), String> {
    let context = CompilationContext::new(Default::default());
    let lowered = lower_file(file, &context)?;
    match validate_trace(&lowered.trace) {
        Ok(()) => {
            println!(
                "{}: ok ({} ops, {} branches)",
                file.display(),
                lowered.trace.len(),
                lowered.trace.branches.len()
            );
            Ok(())
        }
        Err(errors) => {
            for e in &errors {
                eprintln!("{}: {}", file.display(), e);
            }
            Err(format!("{} validation errors", errors.len()))
        }
    }
}

fn show_config(preset: Preset) -> Result<(), String> {
    let config = match preset {
        Preset::Default => JitConfig::default(),
        Preset::Development => JitConfig::development(),
        Preset::Production => JitConfig::production(),
    };
    let text = toml::to_string_pretty(&config).map_err(|e| e.to_string())?;
    print!("{}", text);
    Ok(())
}
