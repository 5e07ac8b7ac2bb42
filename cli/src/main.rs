//! Tether CLI binary
//!
//! Runs a program over a supervised socket channel, relaying this process's
//! stdin to it and its stdout/stderr back.

#![allow(unused_crate_dependencies)]

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
compile_error!("tether supports Linux and FreeBSD only");

use anyhow::Context;
use clap::{Parser, Subcommand};
use cli::{build_options, run, RunRequest};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;
use tether_core::adapters::UnixChannelAdapter;
use tether_core::config::load_spawn_options_from_toml_path;
use tether_core::transcript::CHUNK_SIZE;
use tracing::debug;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Run a program over a supervised stdin/stdout socket channel")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program, relaying stdin to it and its stdout/stderr back
    Run {
        /// TOML file with a [process] table; command-line values override it
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Read wait in ms: 0 polls, negative waits until output or closure
        #[arg(long, allow_negative_numbers = true)]
        timeout_ms: Option<i32>,
        /// Extra environment assignment for the child (repeatable)
        #[arg(long = "env", value_name = "NAME=VALUE")]
        env: Vec<String>,
        /// Stop relaying after this many ms and exit with status 124
        #[arg(long, value_name = "MS")]
        max_runtime_ms: Option<u64>,
        /// Give the child an empty stdin instead of forwarding ours
        #[arg(long)]
        no_stdin: bool,
        /// Program and its arguments (argv[0] is the program)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "PROGRAM")]
        command: Vec<String>,
    },
    /// Validate a process config file and print the resolved options
    Check {
        /// TOML file with a [process] table
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    tether_core::utils::init_tracing(&cli.log_level)?;

    match cli.command {
        Commands::Run {
            config,
            timeout_ms,
            env,
            max_runtime_ms,
            no_stdin,
            command,
        } => {
            let request = RunRequest {
                config,
                command,
                env,
                timeout_ms,
            };
            let opts = build_options(&request)?;
            let input = (!no_stdin).then(spawn_stdin_reader);

            // Unlocked handles: tracing shares stderr from other threads.
            let outcome = run(
                &UnixChannelAdapter::new(),
                &opts,
                input,
                max_runtime_ms.map(Duration::from_millis),
                &mut io::stdout(),
                &mut io::stderr(),
            )
            .with_context(|| format!("running '{}'", opts.program))?;
            Ok(ExitCode::from(outcome.exit_code()))
        }
        Commands::Check { config } => {
            let opts = load_spawn_options_from_toml_path(&config)
                .with_context(|| format!("checking {}", config.display()))?;
            println!("program: {}", opts.program);
            println!("argv: {:?}", opts.argv());
            println!("env: {:?}", opts.env);
            println!("read wait: {:?}", opts.wait_timeout());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Read stdin on a detached thread; it ends with stdin, not with the run
fn spawn_stdin_reader() -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Stopped reading stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}
