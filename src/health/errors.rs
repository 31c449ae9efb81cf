//! Bounded log of classified failures
//!
//! Every failure the monitor sees is kept as an [`ErrorRecord`] in a ring of
//! fixed capacity, oldest evicted first. Operators read statistics and can
//! mark individual records resolved.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use uuid::Uuid;

use crate::error::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// One classified failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    /// Source, group or component the failure belongs to
    pub subject: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
}

impl ErrorRecord {
    pub fn new(category: ErrorCategory, severity: ErrorSeverity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            severity,
            message: message.into(),
            subject: None,
            occurred_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolution_note: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// Counts over the current ring contents
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStatistics {
    pub total: usize,
    pub unresolved: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    /// Newest first
    pub recent: Vec<ErrorRecord>,
}

const RECENT_LIMIT: usize = 10;

/// Fixed-capacity ring of error records
#[derive(Debug, Clone)]
pub struct ErrorLog {
    capacity: usize,
    records: VecDeque<ErrorRecord>,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::new(),
        }
    }

    pub fn push(&mut self, record: ErrorRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn statistics(&self) -> ErrorStatistics {
        let mut stats = ErrorStatistics {
            total: self.records.len(),
            ..Default::default()
        };

        for record in &self.records {
            if !record.resolved {
                stats.unresolved += 1;
            }
            *stats
                .by_category
                .entry(record.category.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_severity
                .entry(record.severity.as_str().to_string())
                .or_default() += 1;
        }

        stats.recent = self.records.iter().rev().take(RECENT_LIMIT).cloned().collect();
        stats
    }

    pub fn unresolved(&self) -> Vec<ErrorRecord> {
        self.records.iter().filter(|r| !r.resolved).cloned().collect()
    }

    /// Critical records within the window ending at `now`
    pub fn critical_within(&self, now: DateTime<Utc>, window: Duration) -> Vec<ErrorRecord> {
        let cutoff = now - window;
        self.records
            .iter()
            .filter(|r| r.severity == ErrorSeverity::Critical && r.occurred_at >= cutoff)
            .cloned()
            .collect()
    }

    /// Mark a record resolved; false if unknown or already resolved
    pub fn resolve(&mut self, id: Uuid, note: Option<String>) -> bool {
        match self.records.iter_mut().find(|r| r.id == id && !r.resolved) {
            Some(record) => {
                record.resolved = true;
                record.resolved_at = Some(Utc::now());
                record.resolution_note = note;
                true
            }
            None => false,
        }
    }
}
