use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Infer table schemas and typed records from JSON event payloads",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Process a newline-delimited JSON payload into typed records per table
    Process(ProcessArgs),
    /// Print the schemas inferred from a payload
    Schema(SchemaArgs),
}

#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// Input payload, one JSON event per line (`-` for stdin)
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Processor configuration (YAML)
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,
    /// Directory receiving `<table>.jsonl` and `failed.jsonl` (stdout if omitted)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    /// Abort on the first event that cannot be processed
    #[arg(long = "break-on-error")]
    pub break_on_error: bool,
    /// Treat the input as a fallback file written by a previous run
    #[arg(long = "fallback")]
    pub fallback: bool,
    /// Destination schemas (YAML) to coerce records to before writing
    #[arg(long = "db-schema")]
    pub db_schema: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct SchemaArgs {
    /// Input payload, one JSON event per line (`-` for stdin)
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Processor configuration (YAML)
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,
    /// Destination schemas (YAML) to compare the inferred tables against
    #[arg(long = "db-schema")]
    pub db_schema: Option<PathBuf>,
}
