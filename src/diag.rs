//! Diagnostic channel for failures that must not abort teardown.
//!
//! A region's destructor has to finish releasing everything it holds, so
//! release failures are reported here instead of being returned.

use tracing::warn;

pub trait DiagnosticSink: Send + Sync {
    /// A release call failed while a region was being torn down.
    fn release_failure(&self, op: &'static str, code: i32);
}

/// Default sink, routing teardown failures to `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn release_failure(&self, op: &'static str, code: i32) {
        warn!(op, code, "release failed during region teardown");
    }
}
