/// Human-readable messages injected into the session transcript.
use crate::report::BillingReport;

/// `"2m 5s"` for durations of a minute or more, `"42s"` otherwise.
/// Negative inputs (clock skew) render as `"0s"`.
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let (minutes, seconds) = (secs / 60, secs % 60);
    if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// The per-session billing summary.
pub fn format_summary(report: &BillingReport, elapsed_secs: i64, currency_symbol: &str) -> String {
    format!(
        "💰 **Session billing summary**\n\
         ⏰ Duration: {}\n\
         📝 API calls: {}\n\
         💰 Total cost: {}{}\n\
         📥 Input tokens: {}\n\
         📤 Output tokens: {}\n\
         📊 Total tokens: {}",
        format_duration(elapsed_secs),
        report.record_count,
        currency_symbol,
        report.cost,
        report.input_tokens,
        report.output_tokens,
        report.total_tokens,
    )
}

/// Error notice shown to the user: bold title, blank line, detail.
pub fn format_error_notice(title: &str, detail: &str) -> String {
    format!("⚠️ **{title}**\n\n{detail}")
}
