use bf_cli::commands::RunCommand;
use clap::Parser;

fn main() {
    env_logger::init();
    if let Err(err) = RunCommand::parse().execute() {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}
