use crate::commands::detect::print_detection_report;
use crate::commands::publish::print_publish_report;
use crate::config::Config;
use crate::support::{load_feeds_or_exit, open_store, print_json, runtime_or_exit, transport_for};
use roadsense_pipeline::run_sequence;
use std::sync::Arc;

pub fn run(config: Config, json: bool) {
    let snapshot = Arc::new(load_feeds_or_exit(&config));
    let runtime = runtime_or_exit();
    let report = runtime
        .block_on(run_sequence(
            Arc::new(open_store(&config)),
            transport_for(&config),
            snapshot,
            config.detection_settings(),
            config.publish_settings(),
        ))
        .unwrap_or_else(|e| {
            eprintln!("error: run aborted: {e}");
            std::process::exit(1);
        });

    if json {
        print_json(&report);
    } else {
        print_detection_report(&report.detection, &config);
        if let Some(publish) = &report.publish {
            print_publish_report(publish, &config);
        }
    }

    if let Some(err) = &report.publish_error {
        eprintln!("error: publish failed: {err}");
        std::process::exit(1);
    }
}
