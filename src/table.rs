//! Aligned plain-text rendering of table schemas.

use std::fmt::Write as _;

use itertools::Itertools;

use crate::schema::Table;

pub fn schema_headers() -> Vec<String> {
    ["column", "type", "observed", "pk"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// One row per column: name, effective type, every observed type, and a
/// primary-key marker.
pub fn schema_rows(table: &Table) -> Vec<Vec<String>> {
    table
        .columns
        .iter()
        .map(|(name, column)| {
            vec![
                name.clone(),
                column.data_type().to_string(),
                column.observed_types().map(|ty| ty.as_str()).join("|"),
                if table.pk_fields.contains(name) {
                    "*".to_string()
                } else {
                    String::new()
                },
            ]
        })
        .collect()
}

pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut widths = headers
        .iter()
        .map(|header| header.chars().count())
        .collect::<Vec<_>>();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell_text(cell).chars().count());
        }
    }

    let mut output = String::new();
    let _ = writeln!(output, "{}", format_row(headers, &widths));
    let rule = widths
        .iter()
        .map(|width| "-".repeat((*width).max(3)))
        .collect::<Vec<_>>();
    let _ = writeln!(output, "{}", format_row(&rule, &widths));
    for row in rows {
        let _ = writeln!(output, "{}", format_row(row, &widths));
    }
    output
}

pub fn print_table(headers: &[String], rows: &[Vec<String>]) {
    print!("{}", render_table(headers, rows));
}

fn format_row(cells: &[String], widths: &[usize]) -> String {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell_text(cell), width = *width))
        .join("  ");
    line.trim_end().to_string()
}

fn cell_text(value: &str) -> String {
    value.replace(['\n', '\r', '\t'], " ")
}
