use crate::config::Config;
use crate::support::{open_store, print_json};
use roadsense_store::CollisionStore;
use serde_json::json;

pub fn run(config: Config, yes: bool, json: bool) {
    let store = open_store(&config);
    if !yes {
        let count = store.list_all().map(|rows| rows.len()).unwrap_or(0);
        eprintln!(
            "error: refusing to clear {count} collision(s) from {} without --yes",
            config.store.path.display()
        );
        std::process::exit(1);
    }

    let removed = store.clear().unwrap_or_else(|e| {
        eprintln!("error: failed to clear {}: {e}", config.store.path.display());
        std::process::exit(1);
    });

    if json {
        print_json(&json!({
            "store": config.store.path.display().to_string(),
            "removed": removed,
        }));
    } else {
        println!("roadsense clear");
        println!("  Store: {}", config.store.path.display());
        println!("  Removed: {removed}");
    }
}
