use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::launcher::{self, RunOptions};
use crate::Error;

#[derive(Parser, Debug)]
#[command(name = "rocked", about = "Minimal Linux container runtime")]
pub struct Cli {
    /// Enable JSON-structured debug logging on stderr.
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Materialize an image and run a command inside a fresh container.
    Run {
        /// Base name of an image archive at blobs/container_images/<NAME>.tar.
        #[arg(short = 'i', long)]
        image: String,

        /// Extra environment variable, KEY=VAL. May be given multiple times.
        #[arg(short = 'e', long = "env", value_parser = parse_env)]
        env: Vec<String>,

        /// Absolute path to the binary to exec, followed by its argv.
        #[arg(trailing_var_arg = true, num_args = 1..)]
        argv: Vec<String>,
    },
}

fn parse_env(s: &str) -> Result<String, String> {
    if s.split_once('=').is_none() {
        return Err(format!("expected KEY=VAL, got {s:?}"));
    }
    Ok(s.to_owned())
}

pub fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if verbose {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Dispatches a parsed `Cli` and returns the process exit code.
pub fn dispatch(cli: Cli) -> i32 {
    match run_command(cli.command) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(%err, "command failed");
            1
        }
    }
}

fn run_command(command: Command) -> Result<i32, Error> {
    match command {
        Command::Run { image, env, argv } => {
            if argv.is_empty() {
                return Err("expected at least one positional argument (the command to run)".into());
            }
            let image_archive =
                PathBuf::from("blobs/container_images").join(format!("{image}.tar"));
            let mut options = RunOptions::new(image_archive, argv);
            options.env = env;
            launcher::run(options)
        }
    }
}
