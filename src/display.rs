//! Terminal presentation: live status table and final summary.
//!
//! Nothing here decides anything; it only formats board snapshots and
//! run reports.

use std::fmt::Write as _;
use std::io::{IsTerminal, Write};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::{Persisted, RunReport};
use crate::status::{BoardRow, CollectorStatus, StatusBoard};

/// Fixed-width table of the board, one line per source.
pub fn render_board(rows: &[BoardRow]) -> String {
    let width = rows.iter().map(|r| r.source.len()).max().unwrap_or(0).max(6);
    let mut out = format!("{:<width$}  {:<8}  {}\n", "SOURCE", "STATUS", "TT BUY");

    for row in rows {
        let value = match (row.status, row.last_value) {
            (_, Some(v)) => v.to_string(),
            (CollectorStatus::Running, None) => "...".to_string(),
            _ => "-".to_string(),
        };
        let _ = writeln!(out, "{:<width$}  {:<8}  {value}", row.source, row.status.as_str());
    }
    out
}

/// Redraws the board on every change until `stop` is cancelled.
///
/// On a terminal the table is redrawn in place; otherwise each change
/// appends a new table.
pub fn spawn_live_view(board: Arc<StatusBoard>, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut changes = board.subscribe();
        let in_place = std::io::stderr().is_terminal();
        let mut drawn = 0usize;

        loop {
            drawn = redraw(&board, drawn, in_place);

            tokio::select! {
                changed = changes.changed() => if changed.is_err() { break },
                _ = stop.cancelled() => break,
            }
        }

        // last state, in case the final update raced the stop signal
        redraw(&board, drawn, in_place);
    })
}

/// Writes the table to stderr, erasing the previous `drawn` lines when
/// drawing in place. Returns the number of lines written.
fn redraw(board: &StatusBoard, drawn: usize, in_place: bool) -> usize {
    let table = render_board(&board.snapshot());
    let mut err = std::io::stderr().lock();
    if in_place && drawn > 0 {
        let _ = write!(err, "\x1b[{drawn}A\x1b[J");
    }
    let _ = write!(err, "{table}");
    let _ = err.flush();
    table.lines().count()
}

/// Human-readable end-of-run report.
pub fn render_summary(report: &RunReport) -> String {
    let mut out = String::new();

    let ok: Vec<_> = report.succeeded().collect();
    let _ = writeln!(out, "Collected {} of {} sources", ok.len(), report.outcomes.len());
    for o in &ok {
        if let Ok(v) = o.result {
            let _ = writeln!(out, "  OK    {:<22} {v}", o.bank);
        }
    }
    for o in report.failed() {
        if let Err(kind) = o.result {
            let _ = writeln!(out, "  FAIL  {:<22} {kind}", o.bank);
        }
    }

    let line = match &report.persisted {
        Persisted::Written(summary) => format!("History updated: {summary}"),
        Persisted::NoData => "No data collected; history unchanged".to_string(),
        Persisted::Interrupted => "Interrupted; history unchanged".to_string(),
        Persisted::Failed(e) => format!("History write FAILED: {e}"),
    };
    out.push_str(&line);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::orchestrator::SourceOutcome;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn row(source: &str, status: CollectorStatus, last_value: Option<Decimal>) -> BoardRow {
        BoardRow {
            source: source.into(),
            status,
            last_value,
        }
    }

    fn outcome(bank: &'static str, result: Result<Decimal, FailureKind>) -> SourceOutcome {
        SourceOutcome {
            source: bank.to_lowercase(),
            bank,
            result,
        }
    }

    #[test]
    fn board_shows_values_and_placeholders() {
        let rows = vec![
            row("kotak", CollectorStatus::Complete, Some(dec!(83.25))),
            row("iob", CollectorStatus::Running, None),
            row("hsbc", CollectorStatus::Failed, None),
        ];
        let text = render_board(&rows);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("kotak") && lines[1].ends_with("83.25"));
        assert!(lines[2].contains("Running") && lines[2].ends_with("..."));
        assert!(lines[3].contains("Failed") && lines[3].ends_with('-'));
    }

    #[test]
    fn summary_lists_failures_with_kind() {
        let report = RunReport {
            outcomes: vec![
                outcome("HSBC", Ok(dec!(83.1))),
                outcome("SBI", Err(FailureKind::Timeout)),
            ],
            persisted: Persisted::NoData,
        };
        let text = render_summary(&report);
        assert!(text.starts_with("Collected 1 of 2 sources"));
        assert!(text.contains("OK    HSBC"));
        assert!(text.contains("FAIL  SBI") && text.contains("timeout"));
        assert!(text.ends_with("No data collected; history unchanged\n"));
    }
}
