//! Roadsense CLI: the `roadsense` command.

mod cli;
mod commands;
mod config;
mod logging;
mod support;

use clap::Parser;
use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref());
    let config = support::load_config_or_exit(cli.config.as_deref());

    match cli.command {
        Commands::Detect {
            tolerance_km,
            full,
            json,
        } => commands::detect::run(config, tolerance_km, full, json),

        Commands::Publish { json } => commands::publish::run(config, json),

        Commands::Run { json } => commands::run::run(config, json),

        Commands::List {
            unpublished,
            route,
            json,
        } => commands::list::run(config, unpublished, route, json),

        Commands::Clear { yes, json } => commands::clear::run(config, yes, json),

        Commands::ConfigCheck { json } => commands::config_check::run(config, json),
    }
}
