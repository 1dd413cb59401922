//! Row and result types produced by RowDescription / DataRow / CommandComplete.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use smallvec::SmallVec;

use super::types::{Format, Oid};

/// Column description from a RowDescription message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    /// OID of the source table, 0 if the column is not a table column
    pub table_oid: u32,
    /// Attribute number within the source table, 0 if not a table column
    pub column_attr: i16,
    pub type_oid: Oid,
    /// Negative for variable-width types
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Column descriptions shared between a result and its batches.
pub type SharedColumns = Arc<Vec<ColumnDescriptor>>;

/// One decoded DataRow. `None` is SQL NULL; `Some` holds the raw text bytes.
///
/// Uses SmallVec to inline rows of up to 16 columns.
pub type Row = SmallVec<[Option<Bytes>; 16]>;

// ============================================================================
// Pending result (accumulator)
// ============================================================================

/// The in-flight result the session accumulates rows into.
#[derive(Debug)]
pub struct PendingResult {
    pub(crate) columns: SharedColumns,
    pub(crate) rows: Vec<Row>,
}

impl PendingResult {
    pub fn new() -> Self {
        Self {
            columns: Arc::new(Vec::new()),
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.rows.is_empty()
    }

    pub(crate) fn set_columns(&mut self, columns: Vec<ColumnDescriptor>) {
        self.columns = Arc::new(columns);
    }

    pub(crate) fn push_row(&mut self, row: Row) {
        self.rows.push(row);
    }

    /// Move the accumulated rows out, leaving the columns in place so a
    /// suspended portal can keep filling the same shape.
    pub(crate) fn take_batch(&mut self) -> QueryResult {
        QueryResult {
            columns: Arc::clone(&self.columns),
            rows: std::mem::take(&mut self.rows),
            command_tag: String::new(),
        }
    }

    /// Hand everything off and reset to a fresh accumulator.
    pub(crate) fn finish(&mut self, command_tag: String) -> QueryResult {
        let done = std::mem::take(self);
        QueryResult {
            columns: done.columns,
            rows: done.rows,
            command_tag,
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    /// Start empty but with the shape of a portal described earlier.
    pub(crate) fn resume(&mut self, columns: SharedColumns) {
        self.columns = columns;
        self.rows.clear();
    }
}

impl Default for PendingResult {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Query result
// ============================================================================

/// Result of a query execution.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: SharedColumns,
    pub rows: Vec<Row>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: String,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Arc::new(Vec::new()),
            rows: Vec::new(),
            command_tag: String::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows affected as reported by the trailing number of the command tag.
    ///
    /// `"INSERT 0 5"` → 5, `"SELECT 3"` → 3, `"BEGIN"` → None.
    pub fn rows_affected(&self) -> Option<u64> {
        self.command_tag
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
    }

    /// Position of the column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Raw cell bytes; `None` for NULL or out of range.
    pub fn get_bytes(&self, row: usize, col: usize) -> Option<&[u8]> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    /// Cell as text. Invalid UTF-8 yields `None`.
    pub fn get_str(&self, row: usize, col: usize) -> Option<&str> {
        self.get_bytes(row, col)
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn is_null(&self, row: usize, col: usize) -> bool {
        matches!(self.rows.get(row).and_then(|r| r.get(col)), Some(None))
    }

    /// Rows as a JSON array of objects keyed by column name, values as
    /// strings or `null`.
    pub fn to_json(&self) -> Value {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let mut obj = Map::with_capacity(row.len());
                for (i, cell) in row.iter().enumerate() {
                    let key = self
                        .columns
                        .get(i)
                        .map(|c| c.name.clone())
                        .unwrap_or_else(|| i.to_string());
                    let value = match cell {
                        Some(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
                        None => Value::Null,
                    };
                    obj.insert(key, value);
                }
                Value::Object(obj)
            })
            .collect();
        Value::Array(rows)
    }
}
