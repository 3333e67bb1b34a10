pub mod cli;
pub mod config;
pub mod data;
pub mod enrichment;
pub mod error;
pub mod flatten;
pub mod io_utils;
pub mod mapping;
pub mod process;
pub mod processor;
pub mod schema;
pub mod schema_cmd;
pub mod table;
pub mod template;
pub mod typing;

use std::{env, sync::OnceLock};

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;

use crate::cli::{Cli, Commands};

pub use crate::{
    error::ProcessingError,
    processor::{FailedFact, ProcessedFile, Processor, parse_fallback_line, parse_json_line},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("event_schema", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Process(args) => process::execute(&args),
        Commands::Schema(args) => schema_cmd::execute(&args),
    }
}
