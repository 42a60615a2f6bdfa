//! Filtered, lazy reads over the audit log.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AuditError, AuditLog};
use crate::config::defaults::AUDIT_QUERY_BATCH;
use crate::types::{AuditEvent, AuditKind, Stage};

/// Selection criteria. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub clip_id: Option<String>,
    #[serde(default)]
    pub kinds: Vec<AuditKind>,
    pub stage: Option<Stage>,
    /// Inclusive lower bound on event timestamp
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on event timestamp
    pub until: Option<DateTime<Utc>>,
    /// Only events with a greater sequence number
    pub after_seq: Option<u64>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn for_clip(clip_id: impl Into<String>) -> Self {
        Self {
            clip_id: Some(clip_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = AuditKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    #[must_use]
    pub const fn after(mut self, seq: u64) -> Self {
        self.after_seq = Some(seq);
        self
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ref clip) = self.clip_id {
            if event.clip_id.as_deref() != Some(clip.as_str()) {
                return false;
            }
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if self.stage.is_some() && event.stage != self.stage {
            return false;
        }
        if self.since.is_some_and(|since| event.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.timestamp >= until) {
            return false;
        }
        true
    }
}

/// Lazy, finite iterator over the events matching a filter.
///
/// The upper sequence bound is fixed when the query is created, so events
/// appended while iterating are not seen and a restarted query yields the
/// same sequence.
pub struct AuditQuery<'a> {
    log: &'a AuditLog,
    filter: AuditFilter,
    upper: u64,
    cursor: u64,
    buffer: VecDeque<AuditEvent>,
    yielded: usize,
    failed: bool,
}

impl<'a> AuditQuery<'a> {
    pub(super) fn new(log: &'a AuditLog, filter: AuditFilter, upper: u64) -> Self {
        let cursor = filter.after_seq.unwrap_or(0);
        Self {
            log,
            filter,
            upper,
            cursor,
            buffer: VecDeque::new(),
            yielded: 0,
            failed: false,
        }
    }

    /// Rewind to the first matching event.
    pub fn restart(&mut self) {
        self.cursor = self.filter.after_seq.unwrap_or(0);
        self.buffer.clear();
        self.yielded = 0;
        self.failed = false;
    }

    /// Highest sequence number this query can return.
    pub const fn upper_bound(&self) -> u64 {
        self.upper
    }

    fn limit_reached(&self) -> bool {
        self.filter.limit.is_some_and(|limit| self.yielded >= limit)
    }
}

impl Iterator for AuditQuery<'_> {
    type Item = Result<AuditEvent, AuditError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed || self.limit_reached() {
                return None;
            }
            if let Some(event) = self.buffer.pop_front() {
                if self.filter.matches(&event) {
                    self.yielded += 1;
                    return Some(Ok(event));
                }
                continue;
            }
            if self.cursor >= self.upper {
                return None;
            }
            match self.log.scan(self.cursor, self.upper, AUDIT_QUERY_BATCH) {
                Ok(batch) => {
                    self.cursor = batch.last().map_or(self.upper, |e| e.seq);
                    self.buffer.extend(batch);
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
