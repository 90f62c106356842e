//! The storage capabilities the inserters rely on.
//!
//! Inserters never talk to a driver directly. They need four things from the
//! destination: a bulk row stream, prepared statements (create and drop),
//! batched execution of a prepared statement, and execution with array
//! parameters. [`Destination`] names exactly those; `insert::postgres`
//! implements it for `sqlx::PgConnection` and `test_support` offers an
//! in-memory double.

use async_trait::async_trait;
use thiserror::Error;

use crate::insert::batch::ColumnBatch;
use crate::models::Record;

/// A statement the destination can prepare once and execute many times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statement {
    pub name: &'static str,
    pub sql: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("row source cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("bulk stream aborted by its source: {0}")]
    SourceAborted(#[from] SourceError),
}

/// Cursor feeding the bulk row stream. `Ok(None)` ends the stream normally;
/// an error aborts it and nothing is committed.
#[async_trait]
pub trait RowSource: Send {
    async fn next_row(&mut self) -> Result<Option<Record>, SourceError>;
}

#[async_trait]
pub trait Destination: Send + 'static {
    /// Stream every row of `rows` into `table`. Returns the number of rows
    /// written; the stream is atomic, a failure commits nothing.
    async fn copy_rows(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: &mut dyn RowSource,
    ) -> Result<u64, DestinationError>;

    async fn prepare_statement(&mut self, statement: &Statement) -> Result<(), DestinationError>;

    async fn deallocate_statement(&mut self, statement: &Statement)
    -> Result<(), DestinationError>;

    /// Execute `statement` once per row as a single unit of work.
    async fn execute_batch(
        &mut self,
        statement: &Statement,
        rows: &[Record],
    ) -> Result<u64, DestinationError>;

    /// Execute `statement` once, binding each column as an array parameter.
    async fn execute_columns(
        &mut self,
        statement: &Statement,
        columns: &ColumnBatch,
    ) -> Result<u64, DestinationError>;
}
