//! Detect-then-publish sequence used by scheduled invocations.

use crate::detect::{DetectionReport, DetectionSettings, run_detection_cycle};
use crate::error::CycleError;
use crate::feed::FeedSnapshot;
use crate::publish::{PublishGate, PublishReport, PublishSettings};
use crate::transport::Transport;
use roadsense_store::CollisionStore;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub detection: DetectionReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_error: Option<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.publish_error.is_none()
    }
}

/// Run detection, then publish.
///
/// A detection failure aborts the sequence. A publish failure is recorded in
/// the report; the sequence still completes.
pub async fn run_sequence(
    store: Arc<dyn CollisionStore>,
    transport: Arc<dyn Transport>,
    snapshot: Arc<FeedSnapshot>,
    detection: DetectionSettings,
    publish: PublishSettings,
) -> Result<RunReport, CycleError> {
    let detection_report = {
        let store = Arc::clone(&store);
        let snapshot = Arc::clone(&snapshot);
        tokio::task::spawn_blocking(move || {
            run_detection_cycle(store.as_ref(), &snapshot, &detection)
        })
        .await
        .map_err(|e| CycleError::Worker(e.to_string()))??
    };

    let gate = PublishGate::new(store, transport, publish);
    let (publish, publish_error) = match gate.run_publish_cycle(&snapshot).await {
        Ok(report) => (Some(report), None),
        Err(err) => {
            tracing::error!(error = %err, "publish cycle failed");
            (None, Some(err.to_string()))
        }
    };

    Ok(RunReport {
        detection: detection_report,
        publish,
        publish_error,
    })
}
