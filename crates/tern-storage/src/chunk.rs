use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Key model of a tablet.
///
/// `Duplicate` keeps every ingested row; `Unique` deduplicates on the key
/// at flush and compaction time, latest write wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeysModel {
    Duplicate,
    Unique,
}

/// Minimal schema carrier for the storage core. Column encodings are the
/// codec layer's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletSchema {
    pub keys_model: KeysModel,
    pub num_columns: usize,
}

impl TabletSchema {
    pub fn new(keys_model: KeysModel, num_columns: usize) -> Self {
        Self {
            keys_model,
            num_columns,
        }
    }
}

/// One row: an opaque sort key plus opaque column values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: Bytes,
    pub columns: Vec<Bytes>,
}

impl Row {
    pub fn new(key: Bytes, columns: Vec<Bytes>) -> Self {
        Self { key, columns }
    }

    pub fn bytes_usage(&self) -> usize {
        self.key.len() + self.columns.iter().map(Bytes::len).sum::<usize>()
    }
}

/// An owned batch of rows, the unit the write path moves around.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    rows: Vec<Row>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn bytes_usage(&self) -> usize {
        self.rows.iter().map(Row::bytes_usage).sum()
    }
}
