use std::{collections::BTreeMap, io::Write};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    cli::ProcessArgs,
    config::ProcessorConfig,
    data::{Record, TypedRecord},
    io_utils,
    processor::{FailedFact, ProcessedFile, Processor, parse_fallback_line, parse_json_line},
    schema,
};

const FAILED_FILE_STEM: &str = "failed";

type ParseFn = fn(&[u8]) -> Result<Record>;

#[derive(Serialize)]
struct TableLine<'a> {
    table: &'a str,
    data: &'a TypedRecord,
}

pub fn execute(args: &ProcessArgs) -> Result<()> {
    let processor = ProcessorConfig::load(&args.config)?
        .build()
        .with_context(|| format!("Building processor from {:?}", args.config))?;
    let (file_name, payload) = io_utils::read_payload(&args.input)?;
    info!(
        "Processing '{}' ({} byte(s)) with template '{}'",
        file_name,
        payload.len(),
        processor.table_name_template()
    );

    let parse: ParseFn = if args.fallback {
        parse_fallback_line
    } else {
        parse_json_line
    };
    let (mut files, failed) =
        processor.process_file_payload(&file_name, &payload, args.break_on_error, parse)?;

    if let Some(path) = &args.db_schema {
        apply_destination_schemas(&processor, &mut files, path)?;
    }

    match &args.output {
        Some(dir) => write_to_directory(dir, &files, &failed)?,
        None => write_to_stdout(&files, &failed)?,
    }

    info!(
        "Processed {} record(s) into {} table(s); {} line(s) failed",
        files.values().map(|file| file.payload().len()).sum::<usize>(),
        files.len(),
        failed.len()
    );
    Ok(())
}

fn apply_destination_schemas(
    processor: &Processor,
    files: &mut BTreeMap<String, ProcessedFile>,
    path: &std::path::Path,
) -> Result<()> {
    let destinations = schema::load_tables(path)?;
    for (name, file) in files.iter_mut() {
        match destinations.get(name) {
            Some(destination) => {
                processor
                    .apply_db_typing(destination, file)
                    .with_context(|| format!("Applying destination schema to table [{name}]"))?;
                debug!("Applied destination schema to table [{name}]");
            }
            None => debug!("No destination schema for table [{name}]; keeping inferred types"),
        }
    }
    Ok(())
}

fn write_to_directory(
    dir: &std::path::Path,
    files: &BTreeMap<String, ProcessedFile>,
    failed: &[FailedFact],
) -> Result<()> {
    for (name, file) in files {
        let path = io_utils::json_lines_path(dir, name)?;
        let count = io_utils::write_json_lines_file(&path, file.payload())?;
        info!("Wrote {count} record(s) for table [{name}] to {path:?}");
    }
    if !failed.is_empty() {
        let path = io_utils::json_lines_path(dir, FAILED_FILE_STEM)?;
        io_utils::write_json_lines_file(&path, failed)?;
        warn!("Wrote {} failed line(s) to {path:?}", failed.len());
    }
    Ok(())
}

fn write_to_stdout(files: &BTreeMap<String, ProcessedFile>, failed: &[FailedFact]) -> Result<()> {
    let mut stdout = io_utils::open_output(None)?;
    let lines = files.iter().flat_map(|(name, file)| {
        file.payload().iter().map(move |data| TableLine {
            table: name.as_str(),
            data,
        })
    });
    io_utils::write_json_lines(&mut stdout, lines)?;
    stdout.flush()?;

    if !failed.is_empty() {
        let mut stderr = std::io::stderr().lock();
        io_utils::write_json_lines(&mut stderr, failed)?;
    }
    Ok(())
}
