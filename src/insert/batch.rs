//! Reusable batch buffers.
//!
//! Buffers are cleared, never reallocated, between flushes so that the two
//! buffers of a pipelined run keep their capacity for the whole load.

use crate::models::{Gender, NameType, Record};

pub trait Batch: Send + Sync + 'static {
    fn with_capacity(capacity: usize) -> Self
    where
        Self: Sized;

    fn push(&mut self, record: Record);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
}

/// Row-wise batch: one statement execution per record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    rows: Vec<Record>,
}

impl RecordBatch {
    pub fn rows(&self) -> &[Record] {
        &self.rows
    }
}

impl Batch for RecordBatch {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            rows: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, record: Record) {
        self.rows.push(record);
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn clear(&mut self) {
        self.rows.clear();
    }
}

/// Column-wise batch, bound as four array parameters of an `UNNEST` insert.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ColumnBatch {
    pub counts: Vec<i32>,
    pub name_types: Vec<NameType>,
    pub texts: Vec<String>,
    pub genders: Vec<Gender>,
}

impl ColumnBatch {
    /// Rebuild the rows this batch encodes, in insertion order.
    pub fn to_records(&self) -> Vec<Record> {
        self.counts
            .iter()
            .zip(&self.name_types)
            .zip(&self.texts)
            .zip(&self.genders)
            .map(|(((&count, &name_type), text), &gender)| Record {
                count,
                text: text.clone(),
                name_type,
                gender,
            })
            .collect()
    }
}

impl Batch for ColumnBatch {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            counts: Vec::with_capacity(capacity),
            name_types: Vec::with_capacity(capacity),
            texts: Vec::with_capacity(capacity),
            genders: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, record: Record) {
        self.counts.push(record.count);
        self.name_types.push(record.name_type);
        self.texts.push(record.text);
        self.genders.push(record.gender);
    }

    fn len(&self) -> usize {
        self.counts.len()
    }

    fn clear(&mut self) {
        self.counts.clear();
        self.name_types.clear();
        self.texts.clear();
        self.genders.clear();
    }
}
