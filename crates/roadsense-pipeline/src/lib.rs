//! # roadsense-pipeline
//!
//! The two scheduled cycles over the collision store.
//!
//! ```text
//! situations.geojson ─┐
//!                     ├─ FeedSnapshot ── detection cycle ──► CollisionStore
//! routes.geojson ─────┘        │                                 │
//!                              └──── publish cycle ◄─────────────┘
//!                                         │ claim → send → mark
//!                                         ▼
//!                                     Transport (outbox | stdout)
//! ```
//!
//! Both cycles are idempotent and safe to overlap with themselves and with
//! each other.

pub mod detect;
pub mod error;
pub mod feed;
pub mod message;
pub mod publish;
pub mod run;
pub mod transport;

pub use detect::{
    DetectionMatches, DetectionMode, DetectionReport, DetectionSettings, find_collisions,
    run_detection_cycle,
};
pub use error::{CycleError, SourceError};
pub use feed::{FeedSnapshot, FeedSources, load_routes, load_situations};
pub use message::{
    CollisionPayload, NEW_COLLISION_EVENT, OutboundMessage, UNKNOWN_SEGMENT, build_message,
    collision_topic, message_id, sanitize_topic_segment,
};
pub use publish::{LEASE_MARGIN, PublishGate, PublishReport, PublishSettings};
pub use run::{RunReport, run_sequence};
pub use transport::{
    OutboxRecord, OutboxTransport, StdoutTransport, Transport, TransportError, read_outbox,
};
