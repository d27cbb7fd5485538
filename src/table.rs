//! Coordinate tables: XYZ rasters dumps, the grid index and stage tables.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// One `x y value` line of a raster converted to XYZ.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XyzRow {
    pub x: f64,
    pub y: f64,
    pub value: f64,
}

/// An XYZ row tagged with the feature (output raster) it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub x: f64,
    pub y: f64,
    pub value: f64,
    pub feature: String,
}

/// A stage table row after the coordinates were swapped for a cell id.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub cell_id: u64,
    pub value: f64,
    pub feature: String,
}

fn table_error(path: &Path, reason: impl Into<String>) -> Error {
    Error::Table {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Reads an XYZ file. Columns may be separated by whitespace or commas; a
/// leading header line is skipped.
pub fn read_xyz(path: &Path) -> Result<Vec<XyzRow>> {
    let content = fs::read_to_string(path)?;
    let mut rows = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|f| !f.is_empty())
            .collect();
        if fields.len() < 3 {
            return Err(table_error(
                path,
                format!("line {} has {} columns, expected 3", index + 1, fields.len()),
            ));
        }
        let parsed: std::result::Result<Vec<f64>, _> =
            fields[..3].iter().map(|f| f.parse::<f64>()).collect();
        match parsed {
            Ok(values) => rows.push(XyzRow {
                x: values[0],
                y: values[1],
                value: values[2],
            }),
            Err(_) if rows.is_empty() && index == 0 => continue,
            Err(e) => {
                return Err(table_error(path, format!("line {}: {e}", index + 1)));
            }
        }
    }
    Ok(rows)
}

/// True for values a table must not carry: NaN and the sentinel.
pub fn is_sentinel(value: f64, sentinel: Option<f64>) -> bool {
    value.is_nan() || sentinel.is_some_and(|s| value == s)
}

/// Drops rows holding the sentinel value and tags the rest with `feature`.
pub fn tag_rows(rows: &[XyzRow], sentinel: Option<f64>, feature: &str) -> Vec<FeatureRow> {
    rows.iter()
        .filter(|row| !is_sentinel(row.value, sentinel))
        .map(|row| FeatureRow {
            x: row.x,
            y: row.y,
            value: row.value,
            feature: feature.to_string(),
        })
        .collect()
}

/// Exact coordinate key; `-0.0` and `0.0` compare equal.
fn coordinate_key(x: f64, y: f64) -> (u64, u64) {
    ((x + 0.0).to_bits(), (y + 0.0).to_bits())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridCell {
    pub x: f64,
    pub y: f64,
    pub cell_id: u64,
}

/// The stage-independent grid index: one 1-based id per data cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridIndex {
    cells: Vec<GridCell>,
}

impl GridIndex {
    /// Numbers every cell that holds neither zero nor the nodata value.
    pub fn from_rows(rows: &[XyzRow], nodata: Option<f64>) -> Self {
        let cells = rows
            .iter()
            .filter(|row| !is_sentinel(row.value, Some(0.0)) && !is_sentinel(row.value, nodata))
            .enumerate()
            .map(|(i, row)| GridCell {
                x: row.x,
                y: row.y,
                cell_id: i as u64 + 1,
            })
            .collect();
        Self { cells }
    }

    pub fn cells(&self) -> &[GridCell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut out = String::from("x,y,cell_ID\n");
        for cell in &self.cells {
            out.push_str(&format!("{},{},{}\n", cell.x, cell.y, cell.cell_id));
        }
        fs::write(path, out)?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut lines = content.lines();
        match lines.next().map(str::trim) {
            Some("x,y,cell_ID") => {}
            other => {
                return Err(table_error(
                    path,
                    format!("unexpected header {:?}, expected \"x,y,cell_ID\"", other.unwrap_or("")),
                ));
            }
        }

        let mut cells = Vec::new();
        for (index, line) in lines.enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();
            let cell = match fields.as_slice() {
                [x, y, id] => x
                    .parse::<f64>()
                    .ok()
                    .zip(y.parse::<f64>().ok())
                    .zip(id.parse::<u64>().ok())
                    .map(|((x, y), cell_id)| GridCell { x, y, cell_id }),
                _ => None,
            };
            let cell =
                cell.ok_or_else(|| table_error(path, format!("malformed row {}", index + 2)))?;
            cells.push(cell);
        }
        Ok(Self { cells })
    }

    /// Inner join on exact coordinates. Rows that miss the grid are dropped
    /// and each (cell, feature) pair is kept once. Output follows cell order,
    /// then input order.
    pub fn join(&self, rows: &[FeatureRow]) -> Vec<TableRow> {
        let lookup: HashMap<(u64, u64), u64> = self
            .cells
            .iter()
            .map(|cell| (coordinate_key(cell.x, cell.y), cell.cell_id))
            .collect();

        let mut seen = HashSet::new();
        let mut joined: Vec<TableRow> = rows
            .iter()
            .filter_map(|row| {
                let cell_id = *lookup.get(&coordinate_key(row.x, row.y))?;
                seen.insert((cell_id, row.feature.clone())).then(|| TableRow {
                    cell_id,
                    value: row.value,
                    feature: row.feature.clone(),
                })
            })
            .collect();
        joined.sort_by_key(|row| row.cell_id);
        joined
    }
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Writes a stage table with columns `cell_ID`, `value_column`, `feature`.
pub fn write_table(path: &Path, value_column: &str, rows: &[TableRow]) -> Result<()> {
    let mut out = format!("cell_ID,{},feature\n", quote(value_column));
    for row in rows {
        out.push_str(&format!("{},{},{}\n", row.cell_id, row.value, quote(&row.feature)));
    }
    fs::write(path, out)?;
    Ok(())
}
