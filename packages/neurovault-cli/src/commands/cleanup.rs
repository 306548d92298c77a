use crate::cli::CleanupArgs;
use crate::commands::{apply_limit, fail, prepare};
use crate::exit_codes;
use crate::output;
use neurovault::StorageReaper;
use std::sync::Arc;

pub fn execute(args: CleanupArgs) -> i32 {
    let (config, store) = match prepare(&args.store) {
        Ok(opened) => opened,
        Err(code) => return code,
    };
    if let Err(code) = apply_limit(&store, args.set_limit) {
        return code;
    }

    let threshold = args.threshold.unwrap_or(config.cleanup_threshold);
    if !(threshold > 0.0 && threshold <= 1.0) {
        eprintln!("Error: --threshold must be in (0, 1], got {}", threshold);
        return exit_codes::INPUT_ERROR;
    }

    let reaper = StorageReaper::new(Arc::new(store), threshold);
    let report = match reaper.check_and_cleanup() {
        Ok(report) => report,
        Err(e) => return fail("Cleanup failed", e),
    };

    if args.json {
        if let Err(code) = output::emit_json(&report) {
            return code;
        }
    } else if !report.triggered {
        println!(
            "Usage {} is below the cleanup threshold {}; nothing to do",
            output::format_bytes(report.bytes_before),
            output::format_bytes(report.threshold_bytes)
        );
    } else {
        println!(
            "Cleanup run {}: deleted {} chunk(s), freed {} ({} -> {})",
            report.run_id,
            report.deleted_chunks,
            output::format_bytes(report.freed_bytes),
            output::format_bytes(report.bytes_before),
            output::format_bytes(report.bytes_after)
        );
        if report.incomplete {
            eprintln!("Warning: only active-session data remains above the threshold");
        }
    }

    if report.over_limit() {
        eprintln!(
            "Error: usage {} still exceeds the limit {}",
            output::format_bytes(report.bytes_after),
            output::format_bytes(report.limit_bytes)
        );
        return exit_codes::CAPACITY_EXCEEDED;
    }
    exit_codes::SUCCESS
}
