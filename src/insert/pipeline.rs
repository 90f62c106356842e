//! Double-buffered batch pipeline.
//!
//! The producer (the caller's task) fills one buffer while a spawned consumer
//! transmits the other. Exactly two buffers exist for the whole run:
//!
//! ```text
//!   producer --handoff(1)--> consumer
//!       ^                       |
//!       +-----recycle(1)--------+
//! ```
//!
//! The producer only hands off a new buffer after taking a cleared one back,
//! so at most one batch is in flight while the next one is being assembled.
//! The consumer stops at its first failure and drops both channel ends; the
//! producer sees the closed channel as the done signal and stops pulling
//! records.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::insert::batch::Batch;
use crate::insert::batched::BatchStrategy;
use crate::insert::destination::Destination;
use crate::insert::{InsertError, InsertFailure, InsertResult};
use crate::models::Record;

/// What the consumer hands back when it finishes: the connection, the rows
/// committed, and the failure that stopped it, if any.
type ConsumerOutcome<D> = (D, u64, Option<InsertError>);

/// Send `value` unless the token fires first. `false` means the value was not
/// delivered, either because of cancellation or because the receiver is gone.
pub(crate) async fn send_or_abort<T>(
    tx: &mpsc::Sender<T>,
    value: T,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(value) => sent.is_ok(),
    }
}

async fn recv_or_abort<T>(rx: &mut mpsc::Receiver<T>, cancel: &CancellationToken) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        value = rx.recv() => value,
    }
}

/// Run `records` through `strategy` with a spawned transmitter. Returns the
/// connection alongside the result; it is `None` only if the transmitter
/// task itself died.
pub(crate) async fn run<S, D>(
    strategy: S,
    conn: D,
    cancel: &CancellationToken,
    records: &mut (dyn Iterator<Item = Record> + Send + '_),
    batch_size: usize,
) -> (Option<D>, InsertResult)
where
    S: BatchStrategy,
    D: Destination,
{
    let (handoff_tx, handoff_rx) = mpsc::channel::<S::Batch>(1);
    let (recycle_tx, mut recycle_rx) = mpsc::channel::<S::Batch>(1);
    let consumer = tokio::spawn(consume(
        strategy,
        conn,
        handoff_rx,
        recycle_tx,
        cancel.clone(),
    ));

    let mut active = <S::Batch as Batch>::with_capacity(batch_size);
    let mut spare = Some(<S::Batch as Batch>::with_capacity(batch_size));
    let mut stopped = false;

    for record in records {
        active.push(record);
        if active.len() < batch_size {
            continue;
        }

        let next = match spare.take() {
            Some(buffer) => buffer,
            None => match recv_or_abort(&mut recycle_rx, cancel).await {
                Some(buffer) => buffer,
                None => {
                    stopped = true;
                    break;
                }
            },
        };
        let full = std::mem::replace(&mut active, next);
        if !send_or_abort(&handoff_tx, full, cancel).await {
            stopped = true;
            break;
        }
    }

    if !stopped && !cancel.is_cancelled() && !active.is_empty() {
        send_or_abort(&handoff_tx, active, cancel).await;
    }
    drop(handoff_tx);

    match consumer.await {
        Ok((conn, inserted, error)) => {
            let result = match error {
                Some(err) => Err(InsertFailure::new(inserted, err)),
                None if cancel.is_cancelled() => {
                    Err(InsertFailure::new(inserted, InsertError::Cancelled))
                }
                None => Ok(inserted),
            };
            (Some(conn), result)
        }
        Err(err) => {
            log::error!("batch transmitter task failed: {}", err);
            (
                None,
                Err(InsertFailure::new(0, InsertError::TaskFailed(err.to_string()))),
            )
        }
    }
}

async fn consume<S, D>(
    strategy: S,
    mut conn: D,
    mut handoff: mpsc::Receiver<S::Batch>,
    recycle: mpsc::Sender<S::Batch>,
    cancel: CancellationToken,
) -> ConsumerOutcome<D>
where
    S: BatchStrategy,
    D: Destination,
{
    let mut inserted = 0u64;
    while let Some(mut batch) = handoff.recv().await {
        if cancel.is_cancelled() {
            log::warn!("batch transmission stopped after {} rows: cancelled", inserted);
            return (conn, inserted, Some(InsertError::Cancelled));
        }

        match strategy.transmit(&mut conn, &batch).await {
            Ok(rows) => {
                inserted += rows;
                log::trace!("transmitted batch of {} rows ({} total)", batch.len(), inserted);
            }
            Err(err) => {
                log::error!("batch transmission failed after {} rows: {}", inserted, err);
                return (conn, inserted, Some(InsertError::Transmit(err)));
            }
        }

        batch.clear();
        // A full recycle slot means the producer already holds a spare.
        let _ = recycle.try_send(batch);
    }
    (conn, inserted, None)
}
