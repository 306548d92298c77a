use crate::cli::StatusArgs;
use crate::commands::{apply_limit, fail, prepare};
use crate::exit_codes;
use crate::output;
use serde::Serialize;

#[derive(Serialize)]
struct StatusOutput {
    db: String,
    total_bytes: u64,
    limit_bytes: u64,
    usage_fraction: f64,
    cleanup_threshold: f64,
    eeg_chunks: u64,
    nirs_chunks: u64,
    active_session: Option<i64>,
}

pub fn execute(args: StatusArgs) -> i32 {
    let (config, store) = match prepare(&args.store) {
        Ok(opened) => opened,
        Err(code) => return code,
    };
    if let Err(code) = apply_limit(&store, args.set_limit) {
        return code;
    }

    let state = match store.storage_state() {
        Ok(state) => state,
        Err(e) => return fail("Failed to read storage state", e),
    };
    let active = match store.active_session() {
        Ok(active) => active,
        Err(e) => return fail("Failed to read active session", e),
    };

    let status = StatusOutput {
        db: args.store.db.display().to_string(),
        total_bytes: state.total_bytes,
        limit_bytes: state.limit_bytes,
        usage_fraction: state.usage_fraction(),
        cleanup_threshold: config.cleanup_threshold,
        eeg_chunks: state.eeg_chunk_count,
        nirs_chunks: state.nirs_chunk_count,
        active_session: active.map(|s| s.id),
    };

    if args.json {
        if let Err(code) = output::emit_json(&status) {
            return code;
        }
    } else {
        println!("Store: {}", status.db);
        println!(
            "Usage: {} of {} ({:.1}%, cleanup at {:.0}%)",
            output::format_bytes(status.total_bytes),
            output::format_bytes(status.limit_bytes),
            status.usage_fraction * 100.0,
            status.cleanup_threshold * 100.0
        );
        println!("Chunks: {} EEG, {} NIRS", status.eeg_chunks, status.nirs_chunks);
        match status.active_session {
            Some(id) => println!("Active session: {}", id),
            None => println!("Active session: none"),
        }
    }

    exit_codes::SUCCESS
}
