//! Session lifecycle handling: time each active period and report its billing
//! when the session goes idle.
//!
//! `message.updated` starts the clock for an idle session. `session.idle`
//! queries the billing tool over the active window, injects a summary (or an
//! error notice) into the session, and always returns the session to idle.
//! Nothing here returns an error to the caller; every failure ends up in the
//! log and, where the user can act on it, in the transcript.

use crate::billing::{BillingError, BillingTool, FailureKind, QueryOutput, TimeWindow};
use crate::config::{BillingConfig, TOOL_PATH_ENV};
use crate::events::HookEvent;
use crate::host::{PromptRequest, SessionHost};
use crate::report::parse_report;
use crate::state::SessionStore;
use crate::summary::{format_duration, format_error_notice, format_summary};
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Which path an event took through the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Session went from idle to active.
    Started,
    /// Session was already active; start time unchanged.
    AlreadyActive,
    /// Idle event for a session with no recorded start.
    Skipped,
    /// Summary delivered to the session.
    Reported,
    /// Summary computed but the host refused it.
    DeliveryFailed,
    /// Tool output had no billable usage or could not be parsed.
    NoActivity,
    /// Billing tool missing or not executable.
    ConfigurationError,
    /// Billing tool failed or timed out.
    QueryFailed,
    /// Any other error while querying.
    Unexpected,
    /// Event type the hook does not handle.
    Ignored,
}

pub struct EventHandler<H> {
    store: SessionStore,
    host: H,
    billing: BillingConfig,
    /// Shown to the user when an unexpected error needs investigating.
    log_file: PathBuf,
}

impl<H: SessionHost> EventHandler<H> {
    pub fn new(host: H, billing: BillingConfig, log_file: PathBuf) -> Self {
        Self {
            store: SessionStore::new(),
            host,
            billing,
            log_file,
        }
    }

    #[allow(dead_code)]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    #[allow(dead_code)]
    pub fn host(&self) -> &H {
        &self.host
    }

    #[allow(dead_code)]
    pub fn into_host(self) -> H {
        self.host
    }

    pub async fn handle(&mut self, event: &HookEvent) -> EventOutcome {
        self.handle_at(event, Utc::now()).await
    }

    /// Handle `event` as if it arrived at `now`.
    pub async fn handle_at(&mut self, event: &HookEvent, now: DateTime<Utc>) -> EventOutcome {
        match event {
            HookEvent::MessageUpdated { session_id } => self.on_message_updated(session_id, now),
            HookEvent::SessionIdle { session_id } => self.on_session_idle(session_id, now).await,
            HookEvent::Other { kind } => {
                tracing::trace!(kind = %kind, "ignoring event");
                EventOutcome::Ignored
            }
        }
    }

    fn on_message_updated(&mut self, session_id: &str, now: DateTime<Utc>) -> EventOutcome {
        if !self.store.record_start(session_id, now) {
            return EventOutcome::AlreadyActive;
        }
        tracing::info!(
            session_id = %session_id,
            trigger = "message.updated",
            start_time = %now.to_rfc3339(),
            "session started, recording start time"
        );
        EventOutcome::Started
    }

    async fn on_session_idle(&mut self, session_id: &str, now: DateTime<Utc>) -> EventOutcome {
        let Some(start) = self.store.get(session_id).start_time() else {
            tracing::debug!(
                session_id = %session_id,
                "no start time recorded, skipping billing query"
            );
            return EventOutcome::Skipped;
        };

        tracing::info!(session_id = %session_id, "session finished, querying billing usage");
        let window = TimeWindow {
            start: start.timestamp(),
            end: now.timestamp(),
        };
        let outcome = self.run_query_cycle(session_id, window).await;

        self.store.reset_to_idle(session_id);
        tracing::info!(session_id = %session_id, outcome = ?outcome, "session reset to idle");
        outcome
    }

    async fn run_query_cycle(&self, session_id: &str, window: TimeWindow) -> EventOutcome {
        tracing::debug!(
            start = window.start,
            end = window.end,
            span_secs = window.span_secs(),
            "billing query window"
        );
        match self.query(window).await {
            Ok(output) => self.report(session_id, &output, window.span_secs()).await,
            Err(err) => self.fail(session_id, &err).await,
        }
    }

    async fn query(&self, window: TimeWindow) -> Result<QueryOutput, BillingError> {
        let tool = BillingTool::locate(&self.billing.tool_path)?;
        tool.query(window, self.billing.timeout()).await
    }

    async fn report(&self, session_id: &str, output: &QueryOutput, elapsed: i64) -> EventOutcome {
        let Some(report) = parse_report(&output.stdout) else {
            tracing::info!(
                session_id = %session_id,
                "no billable usage in session window or report not understood"
            );
            return EventOutcome::NoActivity;
        };

        let text = format_summary(&report, elapsed, &self.billing.currency_symbol);
        let request = PromptRequest::informational(session_id, text);
        if let Err(e) = self.host.prompt(&request).await {
            tracing::warn!(
                session_id = %session_id,
                error = %e,
                detail = %error_chain(&e),
                "failed to deliver billing summary"
            );
            return EventOutcome::DeliveryFailed;
        }

        tracing::info!(
            session_id = %session_id,
            duration = %format_duration(elapsed),
            record_count = report.record_count,
            cost = %report.cost,
            cost_secondary = ?report.cost_secondary,
            input_tokens = %report.input_tokens,
            output_tokens = %report.output_tokens,
            total_tokens = %report.total_tokens,
            "billing summary delivered"
        );
        EventOutcome::Reported
    }

    async fn fail(&self, session_id: &str, err: &BillingError) -> EventOutcome {
        match err.kind() {
            FailureKind::Configuration => {
                tracing::error!(
                    session_id = %session_id,
                    error = %err,
                    tool = %self.billing.tool_path.display(),
                    "billing tool unavailable"
                );
                let detail = format!(
                    "Cannot query billing usage; check the billing tool configuration.\n\n\
                     Path: `{}`\n\n\
                     Set `{TOOL_PATH_ENV}` or install the tool at the default path.",
                    self.billing.tool_path.display()
                );
                self.notify(session_id, "Billing tool unavailable", &detail).await;
                EventOutcome::ConfigurationError
            }
            FailureKind::Query => {
                let (exit_code, stdout, stderr) = match err {
                    BillingError::Failed { output } => {
                        (output.exit_code, output.stdout.as_str(), output.stderr.as_str())
                    }
                    _ => (None, "", ""),
                };
                tracing::error!(
                    session_id = %session_id,
                    error = %err,
                    exit_code = ?exit_code,
                    stdout = %stdout,
                    stderr = %stderr,
                    "billing query failed"
                );
                let mut detail = err.to_string();
                for captured in [stdout, stderr] {
                    let captured = captured.trim_end();
                    if !captured.is_empty() {
                        detail.push_str("\n\n");
                        detail.push_str(captured);
                    }
                }
                self.notify(session_id, "Billing query failed", &detail).await;
                EventOutcome::QueryFailed
            }
            FailureKind::Unexpected => {
                tracing::error!(
                    session_id = %session_id,
                    error = %err,
                    detail = %error_chain(err),
                    "unexpected error during billing query"
                );
                let detail = format!(
                    "An unexpected error occurred while querying billing usage:\n\n\
                     ```\n{err}\n```\n\n\
                     See the log file for details: `{}`",
                    self.log_file.display()
                );
                self.notify(session_id, "Billing query error", &detail).await;
                EventOutcome::Unexpected
            }
        }
    }

    /// Inject an error notice. Delivery failures are logged and dropped.
    async fn notify(&self, session_id: &str, title: &str, detail: &str) {
        let request = PromptRequest::informational(session_id, format_error_notice(title, detail));
        if let Err(e) = self.host.prompt(&request).await {
            tracing::warn!(session_id = %session_id, error = %e, "failed to deliver error notice");
        }
    }
}

/// `err: cause: cause ...` following `source()` links. Causes already
/// rendered by the outer `Display` are not repeated.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        let text = cause.to_string();
        if !out.ends_with(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        current = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostError;
    use crate::logfile::{file_layer, RotatingFile};
    use chrono::TimeZone;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    const SESSION: &str = "ses_test";
    const ZH_REPORT: &str = "记录数: 12 条\n总费用: ¥3.50 (3.50元)\n总输入Token: 1,234\n总输出Token: 567\n总Token: 1,801\n";

    #[derive(Default)]
    struct RecordingHost {
        sent: Mutex<Vec<PromptRequest>>,
        fail: bool,
    }

    impl RecordingHost {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<PromptRequest> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl SessionHost for RecordingHost {
        async fn prompt(&self, request: &PromptRequest) -> Result<(), HostError> {
            self.sent.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(HostError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    /// Temp dir holding a fake billing tool and the captured log file.
    struct Fixture {
        dir: TempDir,
        _log_guard: tracing::subscriber::DefaultGuard,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let sink = RotatingFile::new(dir.path().join("hook.log"), 1024 * 1024, 3);
            let subscriber = tracing_subscriber::registry().with(file_layer(sink, LevelFilter::DEBUG));
            let guard = tracing::subscriber::set_default(subscriber);
            Self {
                dir,
                _log_guard: guard,
            }
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        /// Write an executable script as the billing tool. Each invocation
        /// appends its arguments to `calls.txt`.
        fn tool(&self, body: &str) -> PathBuf {
            let calls = self.path().join("calls.txt");
            let script = format!(
                "#!/bin/sh\necho \"$@\" >> '{}'\n{body}\n",
                calls.display()
            );
            self.raw_tool(&script)
        }

        fn raw_tool(&self, script: &str) -> PathBuf {
            let path = self.path().join("billing-tool");
            std::fs::write(&path, script).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(self.path().join("calls.txt"))
                .map(|s| s.lines().map(str::to_string).collect())
                .unwrap_or_default()
        }

        fn log(&self) -> String {
            std::fs::read_to_string(self.path().join("hook.log")).unwrap_or_default()
        }

        fn log_lines(&self, level: &str) -> usize {
            let tag = format!("[{level:<5}]");
            self.log().lines().filter(|l| l.contains(&tag)).count()
        }

        fn handler<H: SessionHost>(&self, host: H, tool_path: PathBuf) -> EventHandler<H> {
            let billing = BillingConfig {
                tool_path,
                timeout_secs: 10,
                currency_symbol: "¥".to_string(),
            };
            EventHandler::new(host, billing, self.path().join("hook.log"))
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn message(session_id: &str) -> HookEvent {
        HookEvent::MessageUpdated {
            session_id: session_id.to_string(),
        }
    }

    fn idle(session_id: &str) -> HookEvent {
        HookEvent::SessionIdle {
            session_id: session_id.to_string(),
        }
    }

    fn assert_idle<H: SessionHost>(handler: &EventHandler<H>, session_id: &str) {
        let state = handler.store().get(session_id);
        assert!(state.is_idle());
        assert_eq!(state.start_time(), None);
    }

    #[tokio::test]
    async fn test_only_first_message_records_start() {
        let fx = Fixture::new();
        let tool = fx.tool("true");
        let mut handler = fx.handler(RecordingHost::default(), tool);

        assert_eq!(
            handler.handle_at(&message(SESSION), at(1_000)).await,
            EventOutcome::Started
        );
        for t in [1_010, 1_020, 1_030] {
            assert_eq!(
                handler.handle_at(&message(SESSION), at(t)).await,
                EventOutcome::AlreadyActive
            );
        }
        assert_eq!(handler.store().get(SESSION).start_time(), Some(at(1_000)));
        assert_eq!(fx.log_lines("INFO"), 1);
    }

    #[tokio::test]
    async fn test_idle_without_start_does_nothing() {
        let fx = Fixture::new();
        let tool = fx.tool("echo should-not-run");
        let mut handler = fx.handler(RecordingHost::default(), tool);

        assert_eq!(
            handler.handle_at(&idle(SESSION), at(1_000)).await,
            EventOutcome::Skipped
        );
        assert!(fx.calls().is_empty());
        assert!(handler.host().sent().is_empty());
        assert_idle(&handler, SESSION);
    }

    #[tokio::test]
    async fn test_successful_cycle_reports_summary() {
        let fx = Fixture::new();
        let tool = fx.tool(&format!("cat <<'EOF'\n{ZH_REPORT}EOF"));
        let mut handler = fx.handler(RecordingHost::default(), tool);

        handler.handle_at(&message(SESSION), at(1_700_000_000)).await;
        let outcome = handler.handle_at(&idle(SESSION), at(1_700_000_125)).await;

        assert_eq!(outcome, EventOutcome::Reported);
        assert_eq!(
            fx.calls(),
            vec!["--start-time 1700000000 --end-time 1700000125"]
        );

        let sent = handler.host().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].session_id, SESSION);
        assert!(sent[0].no_reply);
        assert!(sent[0].text.starts_with("💰 **Session billing summary**"));
        assert!(sent[0].text.contains("Duration: 2m 5s"));
        assert!(sent[0].text.contains("API calls: 12"));
        assert!(sent[0].text.contains("Total cost: ¥3.50"));
        assert!(sent[0].text.contains("Input tokens: 1,234"));
        assert!(sent[0].text.contains("Total tokens: 1,801"));

        assert_idle(&handler, SESSION);
        assert!(fx.log().contains("billing summary delivered"));
        assert_eq!(fx.log_lines("ERROR"), 0);
    }

    #[tokio::test]
    async fn test_unparseable_report_is_info_only() {
        let fx = Fixture::new();
        let tool = fx.tool("echo '记录数: 0 条'; echo '没有费用记录'");
        let mut handler = fx.handler(RecordingHost::default(), tool);

        handler.handle_at(&message(SESSION), at(1_000)).await;
        let outcome = handler.handle_at(&idle(SESSION), at(1_060)).await;

        assert_eq!(outcome, EventOutcome::NoActivity);
        assert!(handler.host().sent().is_empty());
        assert!(fx
            .log()
            .lines()
            .any(|l| l.contains("[INFO ]") && l.contains("no billable usage")));
        assert_eq!(fx.log_lines("ERROR"), 0);
        assert_idle(&handler, SESSION);
    }

    #[tokio::test]
    async fn test_nonzero_exit_notifies_once_and_resets() {
        let fx = Fixture::new();
        let tool = fx.tool("echo 'partial output'; echo 'token expired' >&2; exit 2");
        let mut handler = fx.handler(RecordingHost::default(), tool);

        handler.handle_at(&message(SESSION), at(1_000)).await;
        let outcome = handler.handle_at(&idle(SESSION), at(1_030)).await;

        assert_eq!(outcome, EventOutcome::QueryFailed);
        let sent = handler.host().sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.starts_with("⚠️ **Billing query failed**"));
        assert!(sent[0].text.contains("exit code: 2"));
        assert!(sent[0].text.contains("partial output"));
        assert!(sent[0].text.contains("token expired"));

        assert_eq!(fx.log_lines("ERROR"), 1);
        assert_idle(&handler, SESSION);
    }

    #[tokio::test]
    async fn test_missing_tool_is_configuration_error() {
        let fx = Fixture::new();
        let missing = fx.path().join("no-such-tool");
        let mut handler = fx.handler(RecordingHost::default(), missing.clone());

        handler.handle_at(&message(SESSION), at(1_000)).await;
        let outcome = handler.handle_at(&idle(SESSION), at(1_030)).await;

        assert_eq!(outcome, EventOutcome::ConfigurationError);
        let sent = handler.host().sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.starts_with("⚠️ **Billing tool unavailable**"));
        assert!(sent[0].text.contains(&missing.display().to_string()));
        assert!(sent[0].text.contains(TOOL_PATH_ENV));
        assert_eq!(fx.log_lines("ERROR"), 1);
        assert_idle(&handler, SESSION);
    }

    #[tokio::test]
    async fn test_timeout_is_query_failure() {
        let fx = Fixture::new();
        let tool = fx.tool("sleep 5");
        let billing = BillingConfig {
            tool_path: tool,
            timeout_secs: 1,
            currency_symbol: "¥".to_string(),
        };
        let mut handler =
            EventHandler::new(RecordingHost::default(), billing, fx.path().join("hook.log"));

        handler.handle_at(&message(SESSION), at(1_000)).await;
        let outcome = handler.handle_at(&idle(SESSION), at(1_030)).await;

        assert_eq!(outcome, EventOutcome::QueryFailed);
        let sent = handler.host().sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("timed out"));
        assert_idle(&handler, SESSION);
    }

    #[tokio::test]
    async fn test_spawn_failure_points_to_log_file() {
        let fx = Fixture::new();
        let tool = fx.raw_tool("#!/nonexistent/interpreter\n");
        let mut handler = fx.handler(RecordingHost::default(), tool);

        handler.handle_at(&message(SESSION), at(1_000)).await;
        let outcome = handler.handle_at(&idle(SESSION), at(1_030)).await;

        assert_eq!(outcome, EventOutcome::Unexpected);
        let sent = handler.host().sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.starts_with("⚠️ **Billing query error**"));
        assert!(sent[0].text.contains("hook.log"));
        assert!(fx.log().contains("unexpected error during billing query"));
        assert_idle(&handler, SESSION);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_warning_and_still_resets() {
        let fx = Fixture::new();
        let tool = fx.tool(&format!("cat <<'EOF'\n{ZH_REPORT}EOF"));
        let mut handler = fx.handler(RecordingHost::failing(), tool);

        handler.handle_at(&message(SESSION), at(1_000)).await;
        let outcome = handler.handle_at(&idle(SESSION), at(1_010)).await;

        assert_eq!(outcome, EventOutcome::DeliveryFailed);
        assert_eq!(handler.host().sent().len(), 1);
        assert_eq!(fx.log_lines("WARN"), 1);
        assert_eq!(fx.log_lines("ERROR"), 0);
        assert_idle(&handler, SESSION);
    }

    #[tokio::test]
    async fn test_new_cycle_after_reset() {
        let fx = Fixture::new();
        let tool = fx.tool(&format!("cat <<'EOF'\n{ZH_REPORT}EOF"));
        let mut handler = fx.handler(RecordingHost::default(), tool);

        handler.handle_at(&message(SESSION), at(1_000)).await;
        handler.handle_at(&idle(SESSION), at(1_010)).await;
        assert_eq!(
            handler.handle_at(&message(SESSION), at(2_000)).await,
            EventOutcome::Started
        );
        handler.handle_at(&idle(SESSION), at(2_045)).await;

        assert_eq!(
            fx.calls(),
            vec![
                "--start-time 1000 --end-time 1010",
                "--start-time 2000 --end-time 2045",
            ]
        );
        let sent = handler.host().sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].text.contains("Duration: 45s"));
        // Second idle without a new message is skipped.
        assert_eq!(
            handler.handle_at(&idle(SESSION), at(2_100)).await,
            EventOutcome::Skipped
        );
        assert!(handler.store().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_are_tracked_independently() {
        let fx = Fixture::new();
        let tool = fx.tool(&format!("cat <<'EOF'\n{ZH_REPORT}EOF"));
        let mut handler = fx.handler(RecordingHost::default(), tool);

        handler.handle_at(&message("a"), at(1_000)).await;
        handler.handle_at(&message("b"), at(1_005)).await;
        handler.handle_at(&idle("a"), at(1_020)).await;

        assert_idle(&handler, "a");
        assert_eq!(handler.store().get("b").start_time(), Some(at(1_005)));
        assert_eq!(handler.host().sent()[0].session_id, "a");
    }

    #[tokio::test]
    async fn test_other_events_are_ignored() {
        let fx = Fixture::new();
        let tool = fx.tool("true");
        let mut handler = fx.handler(RecordingHost::default(), tool);

        let event = HookEvent::Other {
            kind: "file.edited".to_string(),
        };
        assert_eq!(handler.handle(&event).await, EventOutcome::Ignored);
        assert!(handler.store().is_empty());
    }

    #[test]
    fn test_error_chain_follows_sources() {
        let err = BillingError::Spawn {
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no interpreter"),
        };
        assert_eq!(error_chain(&err), "failed to spawn billing tool: no interpreter");
        let timeout = BillingError::TimedOut {
            after: std::time::Duration::from_secs(3),
        };
        assert_eq!(error_chain(&timeout), "billing tool timed out after 3s");
    }
}
