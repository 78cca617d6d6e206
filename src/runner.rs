//! Event loop: read newline-delimited JSON events and feed them to the handler
//! one at a time, in arrival order.
use crate::events::parse_event;
use crate::handler::{EventHandler, EventOutcome};
use crate::host::SessionHost;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Counters for one run of the event loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    /// Lines decoded into events (including ignored ones).
    pub events: u64,
    /// Lines that were not valid events.
    pub malformed: u64,
    pub ignored: u64,
    pub reported: u64,
}

/// Process events until end of input.
///
/// Malformed lines are logged and skipped. Only a read error on the input
/// itself ends the loop early.
pub async fn run_events<R, H>(
    mut reader: R,
    handler: &mut EventHandler<H>,
) -> std::io::Result<RunStats>
where
    R: AsyncBufRead + Unpin,
    H: SessionHost,
{
    let mut stats = RunStats::default();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event = match parse_event(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed event");
                stats.malformed += 1;
                continue;
            }
        };
        stats.events += 1;
        tracing::trace!(kind = %event.kind(), "event received");

        match handler.handle(&event).await {
            EventOutcome::Ignored => stats.ignored += 1,
            EventOutcome::Reported => stats.reported += 1,
            _ => {}
        }
    }

    tracing::info!(
        events = stats.events,
        malformed = stats.malformed,
        ignored = stats.ignored,
        reported = stats.reported,
        "event stream closed"
    );
    Ok(stats)
}
