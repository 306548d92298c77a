use crate::cli::SessionsArgs;
use crate::commands::{fail, prepare};
use crate::exit_codes;
use crate::output;

pub fn execute(args: SessionsArgs) -> i32 {
    let (_, store) = match prepare(&args.store) {
        Ok(opened) => opened,
        Err(code) => return code,
    };

    let summaries = match store.session_summaries() {
        Ok(summaries) => summaries,
        Err(e) => return fail("Failed to list sessions", e),
    };

    if args.json {
        if let Err(code) = output::emit_json(&summaries) {
            return code;
        }
        return exit_codes::SUCCESS;
    }

    if summaries.is_empty() {
        println!("No sessions");
        return exit_codes::SUCCESS;
    }

    println!(
        "{:>6}  {:>8}  {:<23}  {:>6}  {:>6}  {:>12}  {}",
        "ID", "PATIENT", "STARTED", "EEG", "NIRS", "SIZE", "SPAN"
    );
    for summary in &summaries {
        let span = match (summary.first_sample_us, summary.last_sample_us) {
            (Some(first), Some(last)) => format!("{:.1}s", (last - first) as f64 / 1_000_000.0),
            _ => "-".to_string(),
        };
        println!(
            "{:>6}  {:>8}  {:<23}  {:>6}  {:>6}  {:>12}  {}{}",
            summary.session.id,
            summary.session.patient_id,
            output::format_us(summary.session.start_time_us),
            summary.eeg_chunks,
            summary.nirs_chunks,
            output::format_bytes(summary.total_bytes),
            span,
            if summary.session.is_active { "  (active)" } else { "" }
        );
    }

    exit_codes::SUCCESS
}
