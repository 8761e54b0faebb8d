//! Tracing initialisation and run lifecycle events.
//!
//! Call [`init_tracing`] once at program start. The `emit_*` helpers log the
//! run lifecycle with stable `event` names so log pipelines can key on them.

use tracing::{info, warn, Level, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use crate::orchestrator::{PrOutcome, RepositoryReport, RunState, RunSummary};

/// Initialise the global tracing subscriber, logging to stderr.
///
/// stdout is reserved for the run summary. `RUST_LOG` takes precedence over
/// `level`. Only the first call takes effect.
pub fn init_tracing(json: bool, level: Level) {
    subscriber(json, level, std::io::stderr).try_init().ok();
}

/// Subscriber writing human-readable or JSON lines to `writer`.
pub fn subscriber<W>(json: bool, level: Level, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let layer = fmt::layer().with_target(false).with_writer(writer);

    if json {
        Box::new(tracing_subscriber::registry().with(env_filter).with(layer.json()))
    } else {
        Box::new(tracing_subscriber::registry().with(env_filter).with(layer))
    }
}

pub fn emit_run_started(run_id: &Uuid, repositories: usize, fingerprint: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        repositories = repositories,
        fingerprint = %fingerprint,
    );
}

pub fn emit_repository_finished(report: &RepositoryReport) {
    let watermark = report
        .watermark
        .as_ref()
        .map(|w| w.execution_id.as_str())
        .unwrap_or("-");

    if report.state == RunState::Done {
        info!(
            event = "repository.finished",
            repository = %report.repository,
            executions = report.executions,
            passed = report.count(PrOutcome::Passed),
            failed = report.count(PrOutcome::Failed),
            already_reported = report.count(PrOutcome::AlreadyReported),
            publish_failed = report.count(PrOutcome::PublishFailed),
            abandoned = report.count(PrOutcome::Abandoned),
            watermark = %watermark,
        );
    } else {
        warn!(
            event = "repository.failed",
            repository = %report.repository,
            state = ?report.state,
            error = %report.error.as_deref().unwrap_or("unknown"),
        );
    }
}

pub fn emit_run_finished(summary: &RunSummary) {
    let duration_ms = (summary.finished_at - summary.started_at).num_milliseconds();
    info!(
        event = "run.finished",
        run_id = %summary.run_id,
        duration_ms = duration_ms,
        exit_code = summary.exit_code(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(json: bool) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = subscriber(json, Level::INFO, move || writer.clone());
        tracing::subscriber::with_default(subscriber, || {
            emit_run_started(&Uuid::nil(), 2, "0123456789ab");
        });
        let bytes = captured.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_json_logs_go_to_given_writer() {
        let output = capture(true);
        let line: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(line["fields"]["event"], "run.started");
        assert_eq!(line["fields"]["repositories"], 2);
    }

    #[test]
    fn test_text_logs_go_to_given_writer() {
        let output = capture(false);
        assert!(output.contains("run.started"), "{output}");
    }
}
