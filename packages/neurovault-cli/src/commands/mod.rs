pub mod audit;
pub mod chunks;
pub mod cleanup;
pub mod reconcile;
pub mod sessions;
pub mod status;
pub mod verify;

use crate::cli::StoreArgs;
use crate::exit_codes;
use anyhow::Context;
use neurovault::{ChunkStore, StorageConfig};

/// Resolve configuration: `--config` file, else defaults with the
/// `NEUROVAULT_*` environment overlay.
pub fn load_config(args: &StoreArgs) -> anyhow::Result<StorageConfig> {
    match &args.config {
        Some(path) => StorageConfig::from_file(path)
            .with_context(|| format!("Failed to load config '{}'", path.display())),
        None => StorageConfig::from_env().context("Invalid NEUROVAULT_* environment"),
    }
}

pub fn open_store(args: &StoreArgs, config: &StorageConfig) -> anyhow::Result<ChunkStore> {
    log::info!("Opening store {}", args.db.display());
    ChunkStore::open(&args.db, config)
        .with_context(|| format!("Failed to open store '{}'", args.db.display()))
}

/// Config and store together, reporting failures on stderr as exit codes.
pub fn prepare(args: &StoreArgs) -> Result<(StorageConfig, ChunkStore), i32> {
    let config = load_config(args).map_err(|e| {
        eprintln!("Error: {:#}", e);
        exit_codes::INPUT_ERROR
    })?;
    let store = open_store(args, &config).map_err(|e| {
        eprintln!("Error: {:#}", e);
        exit_codes::EXECUTION_ERROR
    })?;
    Ok((config, store))
}

/// Persist `--set-limit` when given. The stored limit is otherwise never
/// touched by opening the store.
pub fn apply_limit(store: &ChunkStore, set_limit: Option<u64>) -> Result<(), i32> {
    let Some(limit) = set_limit else {
        return Ok(());
    };
    if limit == 0 {
        eprintln!("Error: --set-limit must be greater than zero");
        return Err(exit_codes::INPUT_ERROR);
    }
    store
        .set_storage_limit(limit)
        .map_err(|e| fail("Failed to set storage limit", e))
}

pub fn fail(context: &str, error: impl std::fmt::Display) -> i32 {
    eprintln!("Error: {}: {}", context, error);
    exit_codes::EXECUTION_ERROR
}
