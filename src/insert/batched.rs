//! Batch-oriented inserters.
//!
//! [`BatchInserter`] owns the batching loop and the pipeline; the strategy
//! only decides how one full buffer reaches the destination.

use async_trait::async_trait;
use std::num::NonZeroUsize;
use tokio_util::sync::CancellationToken;

use crate::insert::batch::{Batch, ColumnBatch, RecordBatch};
use crate::insert::destination::{Destination, DestinationError, Statement};
use crate::insert::{InsertError, InsertFailure, InsertResult, Inserter, pipeline};
use crate::models::Record;

pub const INSERT_NAME: Statement = Statement {
    name: "insert_name",
    sql: "INSERT INTO names (count, name_type, name_text, gender) VALUES ($1, $2, $3, $4)",
};

pub const INSERT_NAMES_UNNEST: Statement = Statement {
    name: "insert_names_unnest",
    sql: "INSERT INTO names (count, name_type, name_text, gender) \
          SELECT * FROM UNNEST($1::int4[], $2::name_type_enum[], $3::text[], $4::gender_enum[])",
};

#[async_trait]
pub trait BatchStrategy: Copy + Send + Sync + 'static {
    type Batch: Batch;

    fn statement(&self) -> &'static Statement;

    /// Send one full buffer. Returns the rows committed.
    async fn transmit<D: Destination>(
        &self,
        conn: &mut D,
        batch: &Self::Batch,
    ) -> Result<u64, DestinationError>;
}

/// One prepared single-row insert per record, one transaction per batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreparedBatch;

#[async_trait]
impl BatchStrategy for PreparedBatch {
    type Batch = RecordBatch;

    fn statement(&self) -> &'static Statement {
        &INSERT_NAME
    }

    async fn transmit<D: Destination>(
        &self,
        conn: &mut D,
        batch: &RecordBatch,
    ) -> Result<u64, DestinationError> {
        conn.execute_batch(&INSERT_NAME, batch.rows()).await
    }
}

/// One array-parameter insert per batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnnestBatch;

#[async_trait]
impl BatchStrategy for UnnestBatch {
    type Batch = ColumnBatch;

    fn statement(&self) -> &'static Statement {
        &INSERT_NAMES_UNNEST
    }

    async fn transmit<D: Destination>(
        &self,
        conn: &mut D,
        batch: &ColumnBatch,
    ) -> Result<u64, DestinationError> {
        conn.execute_columns(&INSERT_NAMES_UNNEST, batch).await
    }
}

pub struct BatchInserter<S, D> {
    strategy: S,
    conn: Option<D>,
    batch_size: NonZeroUsize,
}

impl<S: BatchStrategy, D: Destination> BatchInserter<S, D> {
    pub fn new(strategy: S, conn: D, batch_size: NonZeroUsize) -> Self {
        Self {
            strategy,
            conn: Some(conn),
            batch_size,
        }
    }

    pub fn batch_size(&self) -> NonZeroUsize {
        self.batch_size
    }

    /// Give the connection back. `None` if a pipelined run lost it.
    pub fn into_inner(self) -> Option<D> {
        self.conn
    }

    async fn prepare(&mut self) -> Result<(), InsertFailure> {
        let statement = self.strategy.statement();
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| InsertFailure::new(0, InsertError::ConnectionLost))?;
        conn.prepare_statement(statement).await.map_err(|err| {
            log::error!("failed to prepare {}: {}", statement.name, err);
            InsertFailure::new(0, InsertError::Prepare(err))
        })?;
        log::debug!("prepared {}", statement.name);
        Ok(())
    }

    async fn release(&mut self) {
        let statement = self.strategy.statement();
        if let Some(conn) = self.conn.as_mut() {
            if let Err(err) = conn.deallocate_statement(statement).await {
                log::warn!("failed to deallocate {}: {}", statement.name, err);
            }
        }
    }
}

#[async_trait]
impl<S: BatchStrategy, D: Destination> Inserter for BatchInserter<S, D> {
    async fn insert(
        &mut self,
        cancel: &CancellationToken,
        records: &mut (dyn Iterator<Item = Record> + Send),
    ) -> InsertResult {
        self.prepare().await?;

        let strategy = self.strategy;
        let batch_size = self.batch_size.get();
        let result = match self.conn.as_mut() {
            Some(conn) => transmit_all(strategy, conn, cancel, records, batch_size).await,
            None => Err(InsertFailure::new(0, InsertError::ConnectionLost)),
        };

        self.release().await;
        result
    }

    async fn insert_with_pipeline(
        &mut self,
        cancel: &CancellationToken,
        records: &mut (dyn Iterator<Item = Record> + Send),
    ) -> InsertResult {
        self.prepare().await?;

        let conn = self
            .conn
            .take()
            .ok_or_else(|| InsertFailure::new(0, InsertError::ConnectionLost))?;
        let (conn, result) =
            pipeline::run(self.strategy, conn, cancel, records, self.batch_size.get()).await;
        self.conn = conn;

        self.release().await;
        result
    }
}

async fn transmit_all<S: BatchStrategy, D: Destination>(
    strategy: S,
    conn: &mut D,
    cancel: &CancellationToken,
    records: &mut (dyn Iterator<Item = Record> + Send + '_),
    batch_size: usize,
) -> InsertResult {
    let mut batch = <S::Batch as Batch>::with_capacity(batch_size);
    let mut inserted = 0u64;

    for record in records {
        batch.push(record);
        if batch.len() < batch_size {
            continue;
        }
        if cancel.is_cancelled() {
            break;
        }
        inserted += send(strategy, conn, &batch, inserted).await?;
        batch.clear();
    }

    if cancel.is_cancelled() {
        log::warn!("batch insert stopped after {} rows: cancelled", inserted);
        return Err(InsertFailure::new(inserted, InsertError::Cancelled));
    }
    if !batch.is_empty() {
        inserted += send(strategy, conn, &batch, inserted).await?;
    }
    Ok(inserted)
}

async fn send<S: BatchStrategy, D: Destination>(
    strategy: S,
    conn: &mut D,
    batch: &S::Batch,
    inserted: u64,
) -> Result<u64, InsertFailure> {
    match strategy.transmit(conn, batch).await {
        Ok(rows) => {
            log::trace!("transmitted batch of {} rows ({} total)", batch.len(), inserted + rows);
            Ok(rows)
        }
        Err(err) => {
            log::error!("batch transmission failed after {} rows: {}", inserted, err);
            Err(InsertFailure::new(inserted, InsertError::Transmit(err)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Gender, NameType};
    use crate::test_support::MemoryDestination;

    fn records(n: i32) -> Vec<Record> {
        (1..=n)
            .map(|i| Record {
                count: i,
                text: format!("Surname{i}"),
                name_type: NameType::Surname,
                gender: if i % 2 == 0 { Gender::Female } else { Gender::Male },
            })
            .collect()
    }

    fn size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    /// Iterator that cancels the token after yielding `after` records.
    struct CancelAfter {
        inner: std::vec::IntoIter<Record>,
        cancel: CancellationToken,
        after: usize,
        yielded: usize,
    }

    impl Iterator for CancelAfter {
        type Item = Record;

        fn next(&mut self) -> Option<Record> {
            if self.yielded == self.after {
                self.cancel.cancel();
            }
            if self.cancel.is_cancelled() {
                return None;
            }
            self.yielded += 1;
            self.inner.next()
        }
    }

    #[tokio::test]
    async fn sync_batches_split_at_batch_size() {
        let dest = MemoryDestination::default();
        let mut inserter = BatchInserter::new(UnnestBatch, dest.clone(), size(2));

        let inserted = inserter
            .insert(&CancellationToken::new(), &mut records(5).into_iter())
            .await
            .unwrap();

        assert_eq!(inserted, 5);
        assert_eq!(dest.batch_sizes(), vec![2, 2, 1]);
        assert_eq!(dest.rows(), records(5));
        assert_eq!(dest.prepared(), vec!["insert_names_unnest"]);
        assert_eq!(dest.deallocated(), vec!["insert_names_unnest"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pipelined_failure_keeps_committed_prefix() {
        let dest = MemoryDestination::default().fail_transmission(2);
        let mut inserter = BatchInserter::new(PreparedBatch, dest.clone(), size(2));

        let failure = inserter
            .insert_with_pipeline(&CancellationToken::new(), &mut records(5).into_iter())
            .await
            .unwrap_err();

        assert_eq!(failure.inserted, 2);
        assert!(matches!(failure.source, InsertError::Transmit(_)));
        assert_eq!(dest.attempts(), 2);
        assert_eq!(dest.rows(), records(2));
        assert!(inserter.into_inner().is_some());
    }

    #[tokio::test]
    async fn sync_failure_keeps_committed_prefix() {
        let dest = MemoryDestination::default().fail_transmission(2);
        let mut inserter = BatchInserter::new(UnnestBatch, dest.clone(), size(2));

        let failure = inserter
            .insert(&CancellationToken::new(), &mut records(5).into_iter())
            .await
            .unwrap_err();

        assert_eq!(failure.inserted, 2);
        assert_eq!(dest.attempts(), 2);
        assert_eq!(dest.deallocated(), vec!["insert_names_unnest"]);
    }

    #[tokio::test]
    async fn failure_stops_pulling_records() {
        let dest = MemoryDestination::default().fail_transmission(1);
        let mut inserter = BatchInserter::new(PreparedBatch, dest.clone(), size(2));
        let mut iter = records(6).into_iter();

        inserter
            .insert(&CancellationToken::new(), &mut iter)
            .await
            .unwrap_err();

        assert_eq!(iter.len(), 4);
    }

    #[tokio::test]
    async fn prepare_failure_inserts_nothing() {
        for pipelined in [false, true] {
            let dest = MemoryDestination::default().fail_prepare();
            let mut inserter = BatchInserter::new(PreparedBatch, dest.clone(), size(2));
            let mut iter = records(3).into_iter();
            let cancel = CancellationToken::new();

            let failure = if pipelined {
                inserter.insert_with_pipeline(&cancel, &mut iter).await
            } else {
                inserter.insert(&cancel, &mut iter).await
            }
            .unwrap_err();

            assert_eq!(failure.inserted, 0);
            assert!(matches!(failure.source, InsertError::Prepare(_)));
            assert_eq!(dest.attempts(), 0);
            assert_eq!(iter.len(), 3);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_reports_cancelled() {
        for pipelined in [false, true] {
            let dest = MemoryDestination::default();
            let mut inserter = BatchInserter::new(UnnestBatch, dest.clone(), size(2));
            let cancel = CancellationToken::new();
            let mut iter = CancelAfter {
                inner: records(10).into_iter(),
                cancel: cancel.clone(),
                after: 5,
                yielded: 0,
            };

            let failure = if pipelined {
                inserter.insert_with_pipeline(&cancel, &mut iter).await
            } else {
                inserter.insert(&cancel, &mut iter).await
            }
            .unwrap_err();

            assert!(failure.is_cancelled(), "pipelined={pipelined}");
            assert!(failure.inserted <= 4);
            assert_eq!(dest.rows().len() as u64, failure.inserted);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_destination_still_gets_every_row_in_order() {
        let dest = MemoryDestination::default().with_latency(std::time::Duration::from_millis(5));
        let mut inserter = BatchInserter::new(UnnestBatch, dest.clone(), size(3));

        let inserted = inserter
            .insert_with_pipeline(&CancellationToken::new(), &mut records(20).into_iter())
            .await
            .unwrap();

        assert_eq!(inserted, 20);
        assert_eq!(dest.batch_sizes(), vec![3, 3, 3, 3, 3, 3, 2]);
        assert_eq!(dest.rows(), records(20));
    }
}
