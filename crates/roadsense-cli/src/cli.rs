use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "roadsense",
    about = "Roadsense: detect situation/route collisions and announce each one once",
    version
)]
pub struct Cli {
    /// Path to a TOML config file (defaults to ./roadsense.toml when present)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Log filter, e.g. `debug` or `roadsense_pipeline=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one detection cycle and upsert collisions into the store
    Detect {
        /// Override the detection tolerance in kilometres
        #[arg(long)]
        tolerance_km: Option<f64>,

        /// Prune stored rows that were not re-detected this cycle
        #[arg(long)]
        full: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one publish cycle over unpublished collisions
    Publish {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Detect, then publish
    Run {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List stored collisions
    List {
        /// Only rows not yet published
        #[arg(long)]
        unpublished: bool,

        /// Only rows for this route id
        #[arg(long)]
        route: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove every stored collision
    Clear {
        /// Confirm the full clear
        #[arg(long)]
        yes: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate and print the resolved configuration
    ConfigCheck {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
