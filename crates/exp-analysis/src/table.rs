use chrono::{DateTime, Local, Utc};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use exp_core::args::display_value;
use exp_core::{Args, Status};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::reader::ExperimentRecord;
use crate::set::CommitGroup;

const FIXED_COLUMNS: [&str; 4] = ["Id", "Start time", "Commit", "Status"];

/// One row per record: id, start time, short commit, status, then one column
/// per non-default argument (first-appearance order) when `display_args` is
/// set.
pub fn experiments_table<'a, I>(records: I, display_args: bool) -> Table
where
    I: IntoIterator<Item = &'a ExperimentRecord>,
{
    let records: Vec<&ExperimentRecord> = records.into_iter().collect();
    let columns = if display_args {
        non_default_names(&records)
    } else {
        Vec::new()
    };
    experiments_table_with_columns(records, &columns)
}

pub fn experiments_table_with_columns<'a, I>(records: I, columns: &[String]) -> Table
where
    I: IntoIterator<Item = &'a ExperimentRecord>,
{
    let mut table = new_table(
        FIXED_COLUMNS
            .iter()
            .map(|s| s.to_string())
            .chain(columns.iter().cloned()),
    );
    for record in records {
        let mut row = fixed_cells(record);
        row.extend(
            columns
                .iter()
                .map(|name| Cell::new(record.args.get(name).map(display_value).unwrap_or_default())),
        );
        table.add_row(row);
    }
    table
}

pub fn commit_group_table(group: &CommitGroup<'_>) -> Table {
    let differing = group.differing_args();
    let summaries: Vec<BTreeMap<String, String>> = group
        .experiments
        .iter()
        .map(|r| flatten(&r.summary))
        .collect();
    let summary_columns = if summaries.len() > 1 {
        informative_columns(&summaries)
    } else {
        summary_names(&summaries)
    };

    let mut table = new_table(
        FIXED_COLUMNS
            .iter()
            .map(|s| s.to_string())
            .chain(differing.iter().cloned())
            .chain(summary_columns.iter().cloned()),
    );
    for (record, summary) in group.experiments.iter().zip(&summaries) {
        let mut row = fixed_cells(record);
        row.extend(
            differing
                .iter()
                .map(|name| Cell::new(record.all_args.get(name).map(display_value).unwrap_or_default())),
        );
        row.extend(
            summary_columns
                .iter()
                .map(|name| Cell::new(summary.get(name).cloned().unwrap_or_default())),
        );
        table.add_row(row);
    }
    table
}

pub fn informative_columns(rows: &[BTreeMap<String, String>]) -> Vec<String> {
    summary_names(rows)
        .into_iter()
        .filter(|name| {
            let mut values = rows.iter().map(|row| row.get(name));
            match values.next() {
                Some(first) => !values.all(|v| v == first),
                None => false,
            }
        })
        .collect()
}

/// Nested objects become dotted keys: `{"val": {"acc": 0.9}}` yields
/// `val.acc = 0.9`.
pub fn flatten(args: &Args) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, value) in args {
        flatten_into(key, value, &mut out);
    }
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, nested) in map {
                flatten_into(&format!("{}.{}", prefix, key), nested, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), display_value(other));
        }
    }
}

pub fn format_timestamp(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|ts| ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn new_table(header: impl Iterator<Item = String>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.map(|h| Cell::new(h).fg(Color::White)).collect::<Vec<_>>());
    table
}

fn fixed_cells(record: &ExperimentRecord) -> Vec<Cell> {
    vec![
        Cell::new(record.id.to_string()).fg(Color::Yellow),
        Cell::new(format_timestamp(record.timestamp)),
        Cell::new(record.metadata.short_sha()).fg(Color::DarkGrey),
        status_cell(record.status),
    ]
}

fn status_cell(status: Status) -> Cell {
    let color = match status {
        Status::Running => Color::Cyan,
        Status::Success => Color::Green,
        Status::Error => Color::Red,
        Status::Unknown => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}

fn non_default_names(records: &[&ExperimentRecord]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for record in records {
        for name in record.args.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
    }
    names
}

fn summary_names(rows: &[BTreeMap<String, String>]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for row in rows {
        for name in row.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
    }
    names
}
