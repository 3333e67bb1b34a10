//! Payload input and JSON-lines output for the command line.
//!
//! The `-` path reads standard input; output falls back to standard output
//! when no path is given.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Serialize;

pub const STDIN_NAME: &str = "stdin";

pub fn is_dash(path: &Path) -> bool {
    path == Path::new("-")
}

/// Reads a whole payload, returning the name to report it under.
pub fn read_payload(path: &Path) -> Result<(String, Vec<u8>)> {
    let mut payload = Vec::new();
    if is_dash(path) {
        io::stdin()
            .lock()
            .read_to_end(&mut payload)
            .context("Reading payload from stdin")?;
        return Ok((STDIN_NAME.to_string(), payload));
    }
    File::open(path)
        .with_context(|| format!("Opening input file {path:?}"))?
        .read_to_end(&mut payload)
        .with_context(|| format!("Reading input file {path:?}"))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok((name, payload))
}

pub fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    let writer: Box<dyn Write> = match path {
        Some(p) if !is_dash(p) => Box::new(BufWriter::new(
            File::create(p).with_context(|| format!("Creating output file {p:?}"))?,
        )),
        _ => Box::new(io::stdout().lock()),
    };
    Ok(writer)
}

/// Writes one JSON document per line.
pub fn write_json_lines<W, T>(writer: &mut W, items: impl IntoIterator<Item = T>) -> Result<usize>
where
    W: Write + ?Sized,
    T: Serialize,
{
    let mut count = 0usize;
    for item in items {
        serde_json::to_writer(&mut *writer, &item).context("Serializing JSON line")?;
        writer.write_all(b"\n")?;
        count += 1;
    }
    Ok(count)
}

/// Creates `dir` when missing and returns the `<stem>.jsonl` path inside it.
pub fn json_lines_path(dir: &Path, stem: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("Creating output directory {dir:?}"))?;
    let safe = stem.replace(['/', '\\'], "_");
    Ok(dir.join(format!("{safe}.jsonl")))
}

pub fn write_json_lines_file<T: Serialize>(
    path: &Path,
    items: impl IntoIterator<Item = T>,
) -> Result<usize> {
    let mut writer = open_output(Some(path))?;
    let count = write_json_lines(&mut writer, items)
        .with_context(|| format!("Writing {path:?}"))?;
    writer.flush()?;
    Ok(count)
}
