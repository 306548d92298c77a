use crate::cli::ReconcileArgs;
use crate::commands::{fail, prepare};
use crate::exit_codes;
use crate::output;

pub fn execute(args: ReconcileArgs) -> i32 {
    let (_, store) = match prepare(&args.store) {
        Ok(opened) => opened,
        Err(code) => return code,
    };

    let report = match store.reconcile_storage_state() {
        Ok(report) => report,
        Err(e) => return fail("Reconcile failed", e),
    };

    if args.json {
        if let Err(code) = output::emit_json(&report) {
            return code;
        }
    } else if report.repaired {
        println!(
            "Repaired storage accounting: {} -> {}, {} -> {} chunk(s)",
            output::format_bytes(report.before.total_bytes),
            output::format_bytes(report.after.total_bytes),
            report.before.chunk_count(),
            report.after.chunk_count()
        );
    } else {
        println!(
            "Storage accounting is consistent ({}, {} chunk(s))",
            output::format_bytes(report.after.total_bytes),
            report.after.chunk_count()
        );
    }

    exit_codes::SUCCESS
}
