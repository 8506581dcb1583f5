use clap::Parser as _;
use rocked::cli::{dispatch, init_logging, Cli};

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    std::process::exit(dispatch(cli));
}
