use crate::cli::VerifyArgs;
use crate::commands::{fail, prepare};
use crate::exit_codes;
use crate::output;
use neurovault::{ChunkMetadata, Modality};
use rayon::prelude::*;
use serde::Serialize;
use std::time::Instant;

#[derive(Serialize)]
struct CorruptChunkOutput {
    modality: Modality,
    chunk_id: i64,
    session_id: i64,
    start_time_us: i64,
    error: String,
}

#[derive(Serialize)]
struct VerifyOutput {
    checked: usize,
    samples_decoded: usize,
    corrupt: Vec<CorruptChunkOutput>,
    /// Failures other than corruption (e.g. busy database)
    errors: Vec<String>,
    elapsed_ms: u128,
}

pub fn execute(args: VerifyArgs) -> i32 {
    let (_, store) = match prepare(&args.store) {
        Ok(opened) => opened,
        Err(code) => return code,
    };

    let modalities: Vec<Modality> = match args.modality {
        Some(m) => vec![m.into()],
        None => Modality::ALL.to_vec(),
    };

    let mut chunks: Vec<ChunkMetadata> = Vec::new();
    for modality in modalities {
        match store.list_chunks(modality) {
            Ok(listed) => chunks.extend(listed),
            Err(e) => return fail("Failed to list chunks", e),
        }
    }

    let started = Instant::now();
    let outcomes: Vec<(&ChunkMetadata, Result<usize, neurovault::StorageError>)> = chunks
        .par_iter()
        .map(|chunk| (chunk, store.decode_chunk(chunk.modality, chunk.id).map(|s| s.len())))
        .collect();

    let mut result = VerifyOutput {
        checked: chunks.len(),
        samples_decoded: 0,
        corrupt: Vec::new(),
        errors: Vec::new(),
        elapsed_ms: 0,
    };
    for (chunk, outcome) in outcomes {
        match outcome {
            Ok(count) => result.samples_decoded += count,
            Err(e) if e.is_corruption() => result.corrupt.push(CorruptChunkOutput {
                modality: chunk.modality,
                chunk_id: chunk.id,
                session_id: chunk.session_id,
                start_time_us: chunk.start_time_us,
                error: e.to_string(),
            }),
            Err(e) => result
                .errors
                .push(format!("{} chunk {}: {}", chunk.modality, chunk.id, e)),
        }
    }
    result.elapsed_ms = started.elapsed().as_millis();

    // Chunks already on record are not audited again.
    for corrupt in &result.corrupt {
        if let Err(e) = store.audit_corrupt_chunk(
            corrupt.modality,
            corrupt.chunk_id,
            corrupt.session_id,
            &corrupt.error,
        ) {
            log::warn!("Could not audit corrupt chunk {}: {}", corrupt.chunk_id, e);
        }
    }

    if args.json {
        if let Err(code) = output::emit_json(&result) {
            return code;
        }
    } else {
        println!(
            "Verified {} chunk(s), {} sample(s) in {}ms",
            result.checked, result.samples_decoded, result.elapsed_ms
        );
        for corrupt in &result.corrupt {
            println!(
                "CORRUPT {} chunk {} (session {}, {}): {}",
                corrupt.modality,
                corrupt.chunk_id,
                corrupt.session_id,
                output::format_us(corrupt.start_time_us),
                corrupt.error
            );
        }
        for error in &result.errors {
            eprintln!("Error: {}", error);
        }
    }

    if !result.corrupt.is_empty() {
        exit_codes::CORRUPTION_FOUND
    } else if !result.errors.is_empty() {
        exit_codes::EXECUTION_ERROR
    } else {
        exit_codes::SUCCESS
    }
}
