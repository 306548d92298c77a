use clap::Parser;

mod cli;
mod commands;
mod exit_codes;
mod output;

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let exit_code = match cli.command {
        cli::Command::Status(args) => commands::status::execute(args),
        cli::Command::Sessions(args) => commands::sessions::execute(args),
        cli::Command::Chunks(args) => commands::chunks::execute(args),
        cli::Command::Audit(args) => commands::audit::execute(args),
        cli::Command::Cleanup(args) => commands::cleanup::execute(args),
        cli::Command::Verify(args) => commands::verify::execute(args),
        cli::Command::Reconcile(args) => commands::reconcile::execute(args),
    };

    std::process::exit(exit_code);
}
