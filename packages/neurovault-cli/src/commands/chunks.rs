use crate::cli::ChunksArgs;
use crate::commands::{fail, prepare};
use crate::exit_codes;
use crate::output;
use neurovault::Modality;

pub fn execute(args: ChunksArgs) -> i32 {
    let (_, store) = match prepare(&args.store) {
        Ok(opened) => opened,
        Err(code) => return code,
    };
    let modality = Modality::from(args.modality);

    let result = match args.session {
        Some(session) if args.start_us.is_some() || args.end_us.is_some() => store.query_time_range(
            modality,
            session,
            args.start_us.unwrap_or(i64::MIN),
            args.end_us.unwrap_or(i64::MAX),
        ),
        Some(session) => store.get_session_index(modality, session),
        None => store.list_chunks(modality),
    };
    let chunks = match result {
        Ok(chunks) => chunks,
        Err(e) => return fail("Failed to list chunks", e),
    };

    if args.json {
        if let Err(code) = output::emit_json(&chunks) {
            return code;
        }
        return exit_codes::SUCCESS;
    }

    println!(
        "{:>8}  {:>7}  {:<23}  {:>8}  {:>3}  {:>3}  {:>10}  QUALITY",
        "ID", "SESSION", "START", "SAMPLES", "CH", "VER", "BYTES"
    );
    for chunk in &chunks {
        println!(
            "{:>8}  {:>7}  {:<23}  {:>8}  {:>3}  {:>3}  {:>10}  {:?}",
            chunk.id,
            chunk.session_id,
            output::format_us(chunk.start_time_us),
            chunk.sample_count,
            chunk.channel_count,
            chunk.encoding_version,
            chunk.byte_length,
            chunk.quality_summary
        );
    }
    eprintln!("{} {} chunk(s)", chunks.len(), modality);

    exit_codes::SUCCESS
}
