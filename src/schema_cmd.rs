use anyhow::{Context, Result};
use itertools::Itertools;
use log::{info, warn};

use crate::{
    cli::SchemaArgs,
    config::ProcessorConfig,
    io_utils,
    processor::parse_json_line,
    schema,
    table::{print_table, schema_headers, schema_rows},
};

pub fn execute(args: &SchemaArgs) -> Result<()> {
    let processor = ProcessorConfig::load(&args.config)?
        .build()
        .with_context(|| format!("Building processor from {:?}", args.config))?;
    let (file_name, payload) = io_utils::read_payload(&args.input)?;
    let (files, failed) =
        processor.process_file_payload(&file_name, &payload, false, parse_json_line)?;
    if !failed.is_empty() {
        warn!(
            "{} line(s) could not be processed and are not reflected in the schemas",
            failed.len()
        );
    }
    let destinations = args
        .db_schema
        .as_deref()
        .map(schema::load_tables)
        .transpose()?;

    let headers = schema_headers();
    for (name, file) in &files {
        println!("Table: {name} ({} record(s))", file.payload().len());
        print_table(&headers, &schema_rows(&file.data_schema));
        if let Some(destinations) = &destinations {
            match destinations.get(name) {
                Some(existing) => {
                    let missing = existing.diff(&file.data_schema);
                    if missing.columns.is_empty() {
                        println!("Destination table is up to date.");
                    } else {
                        println!(
                            "Columns missing from destination: {}",
                            missing.columns.names().join(", ")
                        );
                        print_table(&headers, &schema_rows(&missing));
                    }
                }
                None => println!("Destination has no table [{name}]."),
            }
        }
        println!();
    }
    info!("Inferred {} table schema(s) from '{file_name}'", files.len());
    Ok(())
}
