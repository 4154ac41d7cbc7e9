//! Statistics query and report types shared with statistics-capable plugins

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Half-open time range `[start, end)` for a statistics query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Last `hours` hours ending now
    pub fn last_hours(hours: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - chrono::Duration::hours(hours),
            end,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// What a statistics query is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatsScope {
    Global,
    Chat(String),
    User(String),
}

/// A request for a structured statistics result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsQuery {
    pub range: TimeRange,
    pub scope: StatsScope,
}

impl StatsQuery {
    pub fn new(range: TimeRange, scope: StatsScope) -> Self {
        Self { range, scope }
    }
}

/// Structured result produced by a statistics-capable plugin.
///
/// Plugins are read-only by contract: producing a report must not mutate
/// host data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReport {
    /// Name of the plugin that produced the report
    pub source: String,
    /// Human-readable title
    pub title: String,
    /// Free-form structured payload
    pub data: serde_json::Value,
    pub generated_at: DateTime<Utc>,
}

impl StatsReport {
    pub fn new(source: impl Into<String>, title: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            source: source.into(),
            title: title.into(),
            data,
            generated_at: Utc::now(),
        }
    }
}
