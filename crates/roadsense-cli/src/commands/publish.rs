use crate::config::Config;
use crate::support::{load_feeds_or_exit, open_store, print_json, runtime_or_exit, transport_for};
use roadsense_pipeline::{PublishGate, PublishReport};
use std::sync::Arc;

pub fn run(config: Config, json: bool) {
    let snapshot = load_feeds_or_exit(&config);
    let gate = PublishGate::new(
        Arc::new(open_store(&config)),
        transport_for(&config),
        config.publish_settings(),
    );

    let runtime = runtime_or_exit();
    let report = runtime
        .block_on(gate.run_publish_cycle(&snapshot))
        .unwrap_or_else(|e| {
            eprintln!("error: publish failed: {e}");
            std::process::exit(1);
        });

    if json {
        print_json(&report);
    } else {
        print_publish_report(&report, &config);
    }
}

pub fn print_publish_report(report: &PublishReport, config: &Config) {
    println!("roadsense publish");
    println!("  Base topic: {}", config.publish.base_topic);
    println!("  Found: {}", report.found);
    println!("  Published: {}", report.published);
    println!("  Claim conflicts: {}", report.claim_conflicts);
    println!("  Transport failures: {}", report.transport_failures);
    if report.persistence_failures > 0 {
        println!("  Persistence failures: {}", report.persistence_failures);
    }
    if report.deferred > 0 {
        println!("  Deferred: {}", report.deferred);
    }
    println!("  Duration: {} ms", report.duration_ms);
}
