//! Cleanup scope for the segments of one request

use super::segment;
use std::path::PathBuf;
use tensorbridge_common::{BridgeError, METRICS};
use tracing::{debug, warn};

/// Which side of a request a segment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRole {
    Input,
    Output,
}

#[derive(Debug)]
struct Tracked {
    name: String,
    role: SegmentRole,
    /// Whether the host created the file, as opposed to only reserving the name
    created: bool,
}

/// A segment that could not be released
#[derive(Debug, Clone)]
pub struct ReleaseFailure {
    pub name: String,
    pub error: String,
}

/// Outcome of releasing a scope
#[derive(Debug, Default)]
pub struct ReleaseReport {
    /// Segments this scope unlinked
    pub released: usize,

    /// Input segments the worker had already released after reading
    pub released_by_reader: usize,

    pub failures: Vec<ReleaseFailure>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Log each failure; cleanup problems never replace the request's own result
    pub fn log(&self) {
        for failure in &self.failures {
            warn!(segment = %failure.name, error = %failure.error, "Failed to release shared memory segment");
        }
    }
}

/// Tracks every segment created or reserved for one request and releases
/// them all exactly once, on [`SegmentScope::release_all`] or on drop
#[derive(Debug)]
pub struct SegmentScope {
    dir: PathBuf,
    reader_closes_segment: bool,
    tracked: Vec<Tracked>,
}

impl SegmentScope {
    pub(crate) fn new(dir: PathBuf, reader_closes_segment: bool) -> Self {
        Self {
            dir,
            reader_closes_segment,
            tracked: Vec::new(),
        }
    }

    /// Register a segment
    pub fn track(&mut self, name: impl Into<String>, role: SegmentRole, created: bool) {
        self.tracked.push(Tracked {
            name: name.into(),
            role,
            created,
        });
    }

    /// Names currently tracked
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tracked.iter().map(|t| t.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Release every tracked segment. Failures are collected, never raised.
    pub fn release_all(&mut self) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        for tracked in self.tracked.drain(..) {
            match segment::unlink(&self.dir, &tracked.name) {
                Ok(()) => {
                    METRICS.segments.released.inc();
                    report.released += 1;
                }
                Err(BridgeError::SegmentNotFound(_))
                    if tracked.role == SegmentRole::Input && self.reader_closes_segment =>
                {
                    report.released_by_reader += 1;
                }
                Err(BridgeError::SegmentNotFound(_)) if !tracked.created => {
                    // Reserved output the worker never wrote
                    debug!(segment = %tracked.name, "Output segment was never written");
                }
                Err(e) => {
                    METRICS.segments.release_failures.inc();
                    report.failures.push(ReleaseFailure {
                        name: tracked.name,
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }
}

impl Drop for SegmentScope {
    fn drop(&mut self) {
        if !self.tracked.is_empty() {
            self.release_all().log();
        }
    }
}
