//! Record persistence into the `names` table.
//!
//! Three strategies share one contract ([`Inserter`]):
//!
//! - [`CopyInserter`]: one streaming bulk copy, all or nothing
//! - [`BatchInserter`] with [`PreparedBatch`]: a prepared single-row insert,
//!   executed once per row inside one transaction per batch
//! - [`BatchInserter`] with [`UnnestBatch`]: one array-parameter insert per batch
//!
//! Each runs either synchronously on the caller's task or pipelined, where a
//! spawned task transmits while the caller keeps pulling records. Both modes
//! insert the same rows for the same input.

pub mod batch;
pub mod batched;
pub mod copy_from;
pub mod destination;
mod pipeline;
pub mod postgres;

use async_trait::async_trait;
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::Record;

pub use batch::{Batch, ColumnBatch, RecordBatch};
pub use batched::{BatchInserter, BatchStrategy, PreparedBatch, UnnestBatch};
pub use copy_from::CopyInserter;
pub use destination::{Destination, DestinationError, RowSource, SourceError, Statement};

pub const NAMES_TABLE: &str = "names";
pub const NAMES_COLUMNS: [&str; 4] = ["count", "name_type", "name_text", "gender"];

pub const DEFAULT_BATCH_SIZE: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(size) => size,
    None => unreachable!(),
};

#[derive(Debug, Error)]
pub enum InsertError {
    #[error("prepare failed: {0}")]
    Prepare(#[source] DestinationError),
    #[error("transmission failed: {0}")]
    Transmit(#[source] DestinationError),
    #[error("insert cancelled")]
    Cancelled,
    #[error("destination connection is no longer available")]
    ConnectionLost,
    #[error("transmission task failed: {0}")]
    TaskFailed(String),
}

/// An insert that stopped early. `inserted` rows are already committed.
#[derive(Debug, Error)]
#[error("{source} ({inserted} rows committed)")]
pub struct InsertFailure {
    pub inserted: u64,
    #[source]
    pub source: InsertError,
}

impl InsertFailure {
    pub fn new(inserted: u64, source: InsertError) -> Self {
        Self { inserted, source }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.source, InsertError::Cancelled)
    }
}

pub type InsertResult = Result<u64, InsertFailure>;

/// Common contract of every insertion strategy.
///
/// Both methods consume `records` until it is exhausted, the token is
/// cancelled, or a transmission fails. On failure the error carries the number
/// of rows committed before it. Once a failure is observed no further records
/// are pulled.
#[async_trait]
pub trait Inserter: Send {
    async fn insert(
        &mut self,
        cancel: &CancellationToken,
        records: &mut (dyn Iterator<Item = Record> + Send),
    ) -> InsertResult;

    /// Same contract, overlapping record production with transmission.
    async fn insert_with_pipeline(
        &mut self,
        cancel: &CancellationToken,
        records: &mut (dyn Iterator<Item = Record> + Send),
    ) -> InsertResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertMethod {
    #[default]
    CopyFrom,
    PgxBatch,
    UnnestBatch,
}

impl InsertMethod {
    pub const ALL: [InsertMethod; 3] = [
        InsertMethod::CopyFrom,
        InsertMethod::PgxBatch,
        InsertMethod::UnnestBatch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InsertMethod::CopyFrom => "copyfrom",
            InsertMethod::PgxBatch => "pgxbatch",
            InsertMethod::UnnestBatch => "unnestbatch",
        }
    }
}

impl fmt::Display for InsertMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown insert method '{0}' (expected copyfrom, pgxbatch or unnestbatch)")]
pub struct UnknownInsertMethod(pub String);

impl FromStr for InsertMethod {
    type Err = UnknownInsertMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "copyfrom" | "copy" => Ok(InsertMethod::CopyFrom),
            "pgxbatch" | "batch" | "prepared" => Ok(InsertMethod::PgxBatch),
            "unnestbatch" | "unnest" => Ok(InsertMethod::UnnestBatch),
            _ => Err(UnknownInsertMethod(s.to_string())),
        }
    }
}

/// Build the inserter for `method` over `conn`. `batch_size` is ignored by
/// the copy strategy.
pub fn build_inserter<D: Destination>(
    method: InsertMethod,
    conn: D,
    batch_size: NonZeroUsize,
) -> Box<dyn Inserter> {
    match method {
        InsertMethod::CopyFrom => Box::new(CopyInserter::new(conn)),
        InsertMethod::PgxBatch => Box::new(BatchInserter::new(PreparedBatch, conn, batch_size)),
        InsertMethod::UnnestBatch => Box::new(BatchInserter::new(UnnestBatch, conn, batch_size)),
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
                text: format!("Name{i}"),
                name_type: NameType::Name,
                gender: Gender::Unknown,
            })
            .collect()
    }

    #[test]
    fn method_aliases() {
        assert_eq!("copyfrom".parse::<InsertMethod>().unwrap(), InsertMethod::CopyFrom);
        assert_eq!("COPY".parse::<InsertMethod>().unwrap(), InsertMethod::CopyFrom);
        assert_eq!("prepared".parse::<InsertMethod>().unwrap(), InsertMethod::PgxBatch);
        assert_eq!(" unnest ".parse::<InsertMethod>().unwrap(), InsertMethod::UnnestBatch);
        assert!("bulk".parse::<InsertMethod>().is_err());

        for method in InsertMethod::ALL {
            assert_eq!(method.to_string().parse::<InsertMethod>().unwrap(), method);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn every_method_and_mode_inserts_the_same_rows() {
        let input = records(23);
        let batch_size = NonZeroUsize::new(5).unwrap();

        for method in InsertMethod::ALL {
            for pipelined in [false, true] {
                let dest = MemoryDestination::default();
                let mut inserter = build_inserter(method, dest.clone(), batch_size);
                let cancel = CancellationToken::new();
                let mut iter = input.clone().into_iter();

                let inserted = if pipelined {
                    inserter.insert_with_pipeline(&cancel, &mut iter).await
                } else {
                    inserter.insert(&cancel, &mut iter).await
                }
                .unwrap();

                assert_eq!(inserted, 23, "{method} pipelined={pipelined}");
                assert_eq!(dest.rows(), input, "{method} pipelined={pipelined}");
            }
        }
    }

    #[tokio::test]
    async fn empty_input_inserts_nothing() {
        for method in InsertMethod::ALL {
            let dest = MemoryDestination::default();
            let mut inserter = build_inserter(method, dest.clone(), DEFAULT_BATCH_SIZE);
            let inserted = inserter
                .insert_with_pipeline(&CancellationToken::new(), &mut std::iter::empty::<Record>())
                .await
                .unwrap();
            assert_eq!(inserted, 0);
            assert!(dest.rows().is_empty());
        }
    }

    #[test]
    fn failure_reports_committed_rows() {
        let failure = InsertFailure::new(4, InsertError::Cancelled);
        assert!(failure.is_cancelled());
        assert_eq!(failure.to_string(), "insert cancelled (4 rows committed)");
    }
}
