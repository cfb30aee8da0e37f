use crate::config::Config;
use crate::support::{open_store, print_json, yes_no};
use roadsense_store::{Collision, CollisionStore};

pub fn run(config: Config, unpublished: bool, route: Option<String>, json: bool) {
    let store = open_store(&config);
    let rows = if unpublished {
        store.list_unpublished()
    } else {
        store.list_all()
    }
    .unwrap_or_else(|e| {
        eprintln!("error: failed to read {}: {e}", config.store.path.display());
        std::process::exit(1);
    });
    let rows: Vec<Collision> = rows
        .into_iter()
        .filter(|row| route.as_deref().is_none_or(|r| row.route_id == r))
        .collect();

    if json {
        print_json(&rows);
        return;
    }

    println!("roadsense list");
    println!("  Store: {}", config.store.path.display());
    println!("  Rows: {}", rows.len());
    for row in &rows {
        println!(
            "  - {} @ {}  {:.0} m  detected {}  published {}",
            row.situation_id,
            row.route_id,
            row.distance_km * 1000.0,
            row.detection_timestamp.to_rfc3339(),
            yes_no(row.published)
        );
    }
}
