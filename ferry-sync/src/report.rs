//! Built-in [`ReportSink`]s.

use std::sync::{Mutex, PoisonError};

use ferry_core::{ReportSink, RunReport, StateStore};

/// Logs every report as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn emit(&self, report: &RunReport) {
        if report.is_clean() {
            tracing::info!(
                subject = %report.subject,
                stage = %report.stage,
                succeeded = report.succeeded.len(),
                conflicts = report.conflicts.len(),
                "run report"
            );
        } else {
            for (module, failure) in &report.failed {
                tracing::warn!(subject = %report.subject, module = %module, code = %failure.code, "{}", failure.detail);
            }
            tracing::warn!(
                subject = %report.subject,
                stage = %report.stage,
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                conflicts = report.conflicts.len(),
                "run report with failures"
            );
        }
    }
}

/// Appends reports to `reports.jsonl`. Write errors are logged, not raised.
#[derive(Debug, Clone)]
pub struct StoreSink {
    store: StateStore,
}

impl StoreSink {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl ReportSink for StoreSink {
    fn emit(&self, report: &RunReport) {
        if let Err(err) = self.store.append_report(report) {
            tracing::error!(error = %err, subject = %report.subject, "failed to persist run report");
        }
    }
}

/// Keeps reports in memory for callers that inspect them after a run.
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<RunReport>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<RunReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<RunReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl ReportSink for MemorySink {
    fn emit(&self, report: &RunReport) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{PlanId, ReportSubject};
    use tempfile::TempDir;

    #[test]
    fn store_sink_appends_lines() {
        let home = TempDir::new().unwrap();
        let store = StateStore::new(home.path());
        let sink = StoreSink::new(store.clone());
        sink.emit(&RunReport::new(ReportSubject::Plan(PlanId::from("p")), "PREPARED"));
        sink.emit(&RunReport::new(ReportSubject::Plan(PlanId::from("p")), "EXECUTING"));
        assert_eq!(store.recent_reports(10).unwrap().len(), 2);
    }

    #[test]
    fn memory_sink_keeps_order() {
        let sink = MemorySink::new();
        for stage in ["PREPARED", "EXECUTING"] {
            sink.emit(&RunReport::new(ReportSubject::Plan(PlanId::from("p")), stage));
        }
        assert_eq!(sink.last().unwrap().stage, "EXECUTING");
        assert_eq!(sink.reports().len(), 2);
    }
}
