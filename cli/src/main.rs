#![deny(clippy::all)]

use anyhow::Context;
use std::collections::HashMap;
use std::{fs, path::PathBuf, process};
use structopt::StructOpt;
use tangle::Compiler;

/// The sub-command to execute.
#[derive(Debug, StructOpt)]
enum Command {
    /// Compile source code.
    #[structopt(name = "compile")]
    Compile {
        /// Path to the source code file
        #[structopt(parse(from_os_str), long = "source", short = "s")]
        source_path: PathBuf,
    },

    /// Compile and execute source code. When main carries `@shots(N)`, the
    /// program runs N times on fresh machines and the tracked histograms
    /// are merged.
    #[structopt(name = "run")]
    Run {
        /// Path to the source code file
        #[structopt(parse(from_os_str), long = "source", short = "s")]
        source_path: PathBuf,
        /// Fixed base seed for the simulator RNG, for reproducible runs.
        /// Shot i uses seed + i.
        #[structopt(long = "seed")]
        seed: Option<u64>,
        /// Print the merged tracked histograms as JSON
        #[structopt(long = "json")]
        json: bool,
        /// Suppress echo output
        #[structopt(long = "quiet", short = "q")]
        quiet: bool,
        /// Suppress end-of-run warnings (e.g. unmeasured qubits)
        #[structopt(long = "no-warn")]
        no_warn: bool,
    },

    /// Compile and execute source code, then print the OpenQASM 2.0
    /// transcript of the run.
    #[structopt(name = "qasm")]
    Qasm {
        /// Path to the source code file
        #[structopt(parse(from_os_str), long = "source", short = "s")]
        source_path: PathBuf,
        /// Fixed seed for the simulator RNG
        #[structopt(long = "seed")]
        seed: Option<u64>,
    },
}

/// Tangle executable, for compiling and executing Tangle programs
#[derive(Debug, StructOpt)]
#[structopt(name = "tangle")]
struct Opt {
    #[structopt(subcommand)]
    cmd: Command,
}

fn read_file(path: &PathBuf) -> anyhow::Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("Failed to read file {:?}", path))
}

fn run(opt: Opt) -> anyhow::Result<()> {
    match opt.cmd {
        Command::Compile { source_path } => {
            let source = read_file(&source_path)?;
            Compiler::compile(source)?;
        }

        Command::Run {
            source_path,
            seed,
            json,
            quiet,
            no_warn,
        } => {
            let source = read_file(&source_path)?;
            let compiled = Compiler::compile(source)?;
            let shots = compiled.shots();

            // One fresh machine per shot; tracked histograms merge across
            // shots
            let mut merged: HashMap<String, HashMap<String, u64>> =
                HashMap::new();
            for shot in 0..shots {
                let mut machine = match seed {
                    Some(seed) => compiled.allocate_seeded(seed + shot),
                    None => compiled.allocate(),
                };
                if quiet {
                    machine.set_echo(false);
                }
                if no_warn {
                    machine.set_warn_on_exit(false);
                }
                machine.execute()?;

                // Diagnostics first, then the buffered program output
                for warning in machine.warnings() {
                    eprintln!("{}", warning);
                }
                for line in machine.echo_output() {
                    println!("{}", line);
                }
                for (label, counts) in machine.tracked_counts() {
                    let entry = merged
                        .entry(label.clone())
                        .or_insert_with(HashMap::new);
                    for (outcome, count) in counts {
                        *entry.entry(outcome.clone()).or_insert(0) += count;
                    }
                }
            }

            if !merged.is_empty() {
                if json {
                    println!("{}", serde_json::to_string_pretty(&merged)?);
                } else {
                    let mut entries: Vec<_> = merged.iter().collect();
                    entries.sort_by_key(|(label, _)| label.as_str());
                    for (label, counts) in entries {
                        println!("{} ({} shots):", label, shots);
                        let mut outcomes: Vec<_> = counts.iter().collect();
                        outcomes.sort();
                        for (outcome, count) in outcomes {
                            println!("  {} -> {}", outcome, count);
                        }
                    }
                }
            }
        }

        Command::Qasm { source_path, seed } => {
            let source = read_file(&source_path)?;
            let compiled = Compiler::compile(source)?;
            let mut machine = match seed {
                Some(seed) => compiled.allocate_seeded(seed),
                None => compiled.allocate(),
            };
            // Only the transcript is wanted here
            machine.set_echo(false);
            machine.set_warn_on_exit(false);
            machine.execute()?;
            print!("{}", machine.qasm());
        }
    }
    Ok(())
}

fn main() {
    let exit_code = match run(Opt::from_args()) {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("{:#}", err);
            1
        }
    };
    process::exit(exit_code);
}
