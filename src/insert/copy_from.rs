//! Streaming bulk-copy inserter.
//!
//! The whole input goes through a single copy stream, so the insert is all
//! or nothing: any failure, including cancellation, reports zero rows.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::insert::destination::{Destination, DestinationError, RowSource, SourceError};
use crate::insert::pipeline::send_or_abort;
use crate::insert::{InsertError, InsertFailure, InsertResult, Inserter, NAMES_COLUMNS, NAMES_TABLE};
use crate::models::Record;

/// Records buffered between producer and copy stream in pipelined mode.
const COPY_FEED_DEPTH: usize = 1024;

pub struct CopyInserter<D> {
    conn: Option<D>,
}

impl<D: Destination> CopyInserter<D> {
    pub fn new(conn: D) -> Self {
        Self { conn: Some(conn) }
    }

    pub fn into_inner(self) -> Option<D> {
        self.conn
    }
}

/// Pulls straight from the caller's iterator.
struct IterSource<'a, 'b> {
    records: &'a mut (dyn Iterator<Item = Record> + Send + 'b),
    cancel: &'a CancellationToken,
}

#[async_trait]
impl RowSource for IterSource<'_, '_> {
    async fn next_row(&mut self) -> Result<Option<Record>, SourceError> {
        if self.cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        match self.records.next() {
            Some(record) => Ok(Some(record)),
            // The iterator may have ended because of the cancellation.
            None if self.cancel.is_cancelled() => Err(SourceError::Cancelled),
            None => Ok(None),
        }
    }
}

/// Receives records from the producer task.
struct ChannelSource {
    rx: mpsc::Receiver<Record>,
    cancel: CancellationToken,
}

#[async_trait]
impl RowSource for ChannelSource {
    async fn next_row(&mut self) -> Result<Option<Record>, SourceError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SourceError::Cancelled),
            record = self.rx.recv() => Ok(record),
        }
    }
}

fn copy_outcome(result: Result<u64, DestinationError>) -> InsertResult {
    match result {
        Ok(rows) => {
            log::debug!("copied {} rows into {}", rows, NAMES_TABLE);
            Ok(rows)
        }
        Err(DestinationError::SourceAborted(SourceError::Cancelled)) => {
            log::warn!("copy into {} aborted: cancelled", NAMES_TABLE);
            Err(InsertFailure::new(0, InsertError::Cancelled))
        }
        Err(err) => {
            log::error!("copy into {} failed: {}", NAMES_TABLE, err);
            Err(InsertFailure::new(0, InsertError::Transmit(err)))
        }
    }
}

#[async_trait]
impl<D: Destination> Inserter for CopyInserter<D> {
    async fn insert(
        &mut self,
        cancel: &CancellationToken,
        records: &mut (dyn Iterator<Item = Record> + Send),
    ) -> InsertResult {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| InsertFailure::new(0, InsertError::ConnectionLost))?;
        let mut source = IterSource { records, cancel };
        copy_outcome(conn.copy_rows(NAMES_TABLE, &NAMES_COLUMNS, &mut source).await)
    }

    async fn insert_with_pipeline(
        &mut self,
        cancel: &CancellationToken,
        records: &mut (dyn Iterator<Item = Record> + Send),
    ) -> InsertResult {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| InsertFailure::new(0, InsertError::ConnectionLost))?;

        let (tx, rx) = mpsc::channel::<Record>(COPY_FEED_DEPTH);
        let mut source = ChannelSource {
            rx,
            cancel: cancel.clone(),
        };
        let consumer = tokio::spawn(async move {
            let result = conn.copy_rows(NAMES_TABLE, &NAMES_COLUMNS, &mut source).await;
            (conn, result)
        });

        for record in records {
            // A failed send means the copy already ended; stop pulling.
            if !send_or_abort(&tx, record, cancel).await {
                break;
            }
        }
        drop(tx);

        match consumer.await {
            Ok((conn, result)) => {
                self.conn = Some(conn);
                copy_outcome(result)
            }
            Err(err) => {
                log::error!("copy task failed: {}", err);
                Err(InsertFailure::new(0, InsertError::TaskFailed(err.to_string())))
            }
        }
    }
}
