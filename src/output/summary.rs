//! Console summaries
//!
//! Compact tables printed after a run: the stress scenario summary with
//! verdict icons, and the status snapshot listing for the `status`
//! subcommand.

use crate::probe::status::StatusSnapshot;
use crate::runner::verdict::{StressRunResult, Verdict};

fn verdict_icon(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Pass => "✅ PASS",
        Verdict::Fail => "❌ FAIL",
        Verdict::Warn => "⚠️  WARN",
    }
}

/// Print a compact per-scenario summary table to stdout.
pub fn print_summary(result: &StressRunResult) {
    const COL_W: [usize; 6] = [24, 6, 6, 8, 10, 14];
    let headers = ["Scenario", "Sent", "Rcvd", "Drop %", "P95 ms", "Verdict"];
    let sep = "─".repeat(COL_W.iter().sum::<usize>() + COL_W.len() * 3 + 1);

    println!();
    println!("  Stress Run  {}", result.run_id);
    println!("  Port: {}  Baudrate: {}", result.port, result.baudrate);
    println!("  Started: {}   Ended: {}", result.started_at, result.ended_at);
    println!("{sep}");
    let header_line: Vec<String> = headers
        .iter()
        .zip(COL_W)
        .map(|(h, w)| format!("{h:<w$}"))
        .collect();
    println!(" {}", header_line.join(" │ "));
    println!("{sep}");

    for scenario in &result.scenarios {
        let row = [
            scenario.name.clone(),
            scenario.messages_sent.to_string(),
            scenario.messages_received.to_string(),
            format!("{:.2}%", scenario.drop_ratio * 100.0),
            format!("{:.1}", scenario.p95_ms),
            verdict_icon(scenario.verdict).to_string(),
        ];
        let row_line: Vec<String> = row
            .iter()
            .zip(COL_W)
            .map(|(v, w)| format!("{v:<w$}"))
            .collect();
        println!(" {}", row_line.join(" │ "));
        for reason in &scenario.failure_reasons {
            println!("   └─ {reason}");
        }
    }

    println!("{sep}");
    println!("  Overall: {}", verdict_icon(result.overall_verdict));
    println!();
}

/// Print the statistics and task tables of one snapshot.
pub fn print_status_snapshot(snapshot: &StatusSnapshot) {
    println!();
    println!(
        "  Status snapshot ({} statistics, {} tasks, complete: {})",
        snapshot.received_statistics, snapshot.received_tasks, snapshot.complete
    );
    println!();
    println!("  {:<32} {:>12}", "Counter", "Value");
    for (name, value) in &snapshot.statistics {
        println!("  {name:<32} {value:>12}");
    }
    println!();
    println!(
        "  {:<26} {:>12} {:>10} {:>12}",
        "Task", "Abs µs", "Percent", "Watermark"
    );
    for (name, task) in &snapshot.tasks {
        println!(
            "  {name:<26} {:>12} {:>10} {:>12}",
            task.absolute_time_us, task.percent_time, task.high_watermark
        );
    }
    println!();
}
