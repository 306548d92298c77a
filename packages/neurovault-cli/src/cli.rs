use clap::{Args, Parser, Subcommand, ValueEnum};
use neurovault::Modality;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "neurovault",
    version,
    about = "Inspect and maintain neurovault EEG/NIRS chunk stores",
    long_about = "Inspect and maintain neurovault EEG/NIRS chunk stores.\n\
                  Configuration comes from --config, else NEUROVAULT_* environment variables."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show storage usage against the configured limit
    Status(StatusArgs),
    /// List sessions with per-session totals
    Sessions(SessionsArgs),
    /// List chunk metadata for one modality
    Chunks(ChunksArgs),
    /// Show recent audit log entries
    Audit(AuditArgs),
    /// Evict the oldest inactive chunks if usage is over the threshold
    Cleanup(CleanupArgs),
    /// Decode every chunk and report corrupt ones
    Verify(VerifyArgs),
    /// Recompute storage accounting from the chunk tables
    Reconcile(ReconcileArgs),
}

/// Location of the store and its configuration
#[derive(Args, Clone)]
pub struct StoreArgs {
    /// Path to the SQLite database file
    #[arg(long, env = "NEUROVAULT_DB")]
    pub db: PathBuf,

    /// JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModalityArg {
    Eeg,
    Nirs,
}

impl From<ModalityArg> for Modality {
    fn from(arg: ModalityArg) -> Self {
        match arg {
            ModalityArg::Eeg => Modality::Eeg,
            ModalityArg::Nirs => Modality::Nirs,
        }
    }
}

#[derive(Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Persist a new storage limit in bytes before running
    #[arg(long, value_name = "BYTES")]
    pub set_limit: Option<u64>,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct SessionsArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct ChunksArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, value_enum, default_value_t = ModalityArg::Eeg)]
    pub modality: ModalityArg,

    /// Restrict to one session
    #[arg(long)]
    pub session: Option<i64>,

    /// Range start in microseconds (requires --session)
    #[arg(long, requires = "session")]
    pub start_us: Option<i64>,

    /// Range end in microseconds, exclusive (requires --session)
    #[arg(long, requires = "session")]
    pub end_us: Option<i64>,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct AuditArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Only entries of this type (e.g. STORAGE_CLEANUP)
    #[arg(long = "type")]
    pub event_type: Option<String>,

    /// Maximum number of entries, newest first
    #[arg(long, default_value_t = 50)]
    pub limit: usize,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Override the configured cleanup threshold (0, 1]
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Persist a new storage limit in bytes before running
    #[arg(long, value_name = "BYTES")]
    pub set_limit: Option<u64>,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Only verify one modality
    #[arg(long, value_enum)]
    pub modality: Option<ModalityArg>,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct ReconcileArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}
