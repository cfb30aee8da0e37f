use crate::config::Config;
use crate::support::{load_feeds_or_exit, open_store, print_json};
use roadsense_pipeline::{DetectionMode, DetectionReport, run_detection_cycle};

pub fn run(config: Config, tolerance_km: Option<f64>, full: bool, json: bool) {
    let mut settings = config.detection_settings();
    if let Some(tolerance_km) = tolerance_km {
        settings.tolerance_km = tolerance_km;
    }
    if full {
        settings.mode = DetectionMode::Full;
    }

    let snapshot = load_feeds_or_exit(&config);
    let store = open_store(&config);
    let report = run_detection_cycle(&store, &snapshot, &settings).unwrap_or_else(|e| {
        eprintln!("error: detection failed: {e}");
        std::process::exit(1);
    });

    if json {
        print_json(&report);
    } else {
        print_detection_report(&report, &config);
    }
}

pub fn print_detection_report(report: &DetectionReport, config: &Config) {
    println!("roadsense detect");
    println!("  Store: {}", config.store.path.display());
    println!(
        "  Mode: {}",
        match report.mode {
            DetectionMode::Incremental => "incremental",
            DetectionMode::Full => "full",
        }
    );
    println!("  Tolerance: {} km", report.tolerance_km);
    println!(
        "  Situations: {} ({} skipped, {} geometry warnings)",
        report.situations_total, report.situations_skipped, report.geometry_warnings
    );
    println!(
        "  Routes: {} ({} skipped, {} outside area)",
        report.routes_total, report.routes_skipped, report.routes_outside_area
    );
    if report.features_skipped > 0 {
        println!("  Malformed features skipped: {}", report.features_skipped);
    }
    println!(
        "  Pairs: {} evaluated, {} pre-filtered, {} errors",
        report.pairs_evaluated, report.pairs_prefiltered, report.match_errors
    );
    println!(
        "  Collisions: {} found ({} new, {} refreshed, {} unchanged)",
        report.collisions_found, report.created, report.refreshed, report.unchanged
    );
    if report.persistence_failures > 0 {
        println!("  Persistence failures: {}", report.persistence_failures);
    }
    if report.mode == DetectionMode::Full {
        println!("  Pruned: {}", report.pruned);
    }
    println!("  Duration: {} ms", report.duration_ms);
}
