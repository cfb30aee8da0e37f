//! Situation and route records as read from the feeds.

use crate::geometry::{Geometry, Position};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Situation severity.
///
/// Parsing is case-insensitive; anything outside the known set maps to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Severity {
    None,
    Low,
    High,
    Highest,
    #[default]
    Unknown,
}

impl Severity {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" => Self::None,
            "low" => Self::Low,
            "high" => Self::High,
            "highest" => Self::Highest,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::High => "high",
            Self::Highest => "highest",
            Self::Unknown => "unknown",
        }
    }
}

impl From<String> for Severity {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive attributes of a situation, shared by all its primitives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SituationAttributes {
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub situation_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    /// Upstream feed filter the situation was fetched with.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter_used: String,
}

/// A traffic situation. Read-only to the core.
#[derive(Debug, Clone, PartialEq)]
pub struct Situation {
    pub id: String,
    pub geometry: Geometry,
    pub attributes: SituationAttributes,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Situation {
    pub fn new(id: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            id: id.into(),
            geometry,
            attributes: SituationAttributes::default(),
            updated_at: None,
        }
    }

    pub fn with_attributes(mut self, attributes: SituationAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

/// A static transit route.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub id: String,
    pub name: String,
    pub path: Vec<Position>,
}

impl Route {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: Vec<Position>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path,
        }
    }
}
