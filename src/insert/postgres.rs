//! [`Destination`] over a live PostgreSQL connection.
//!
//! - bulk copy: `COPY ... FROM STDIN` in text format, sent in chunks
//! - prepared statements: sqlx's per-connection statement cache
//! - batches: one transaction per batch (sqlx has no protocol pipelining)
//! - columns: the batch bound as four typed arrays

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};

use crate::insert::batch::ColumnBatch;
use crate::insert::destination::{Destination, DestinationError, RowSource, Statement};
use crate::models::Record;

const COPY_CHUNK_BYTES: usize = 64 * 1024;

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn copy_statement(table: &str, columns: &[&str]) -> String {
    let columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "COPY {} ({}) FROM STDIN",
        quote_ident(table),
        columns.join(", ")
    )
}

/// Append `text` escaped for the COPY text format.
fn push_copy_text(buf: &mut Vec<u8>, text: &str) {
    for byte in text.bytes() {
        match byte {
            b'\\' => buf.extend_from_slice(b"\\\\"),
            b'\t' => buf.extend_from_slice(b"\\t"),
            b'\n' => buf.extend_from_slice(b"\\n"),
            b'\r' => buf.extend_from_slice(b"\\r"),
            other => buf.push(other),
        }
    }
}

/// One COPY text-format line, columns in `NAMES_COLUMNS` order.
fn encode_copy_row(buf: &mut Vec<u8>, record: &Record) {
    buf.extend_from_slice(record.count.to_string().as_bytes());
    buf.push(b'\t');
    buf.extend_from_slice(record.name_type.as_str().as_bytes());
    buf.push(b'\t');
    push_copy_text(buf, &record.text);
    buf.push(b'\t');
    buf.extend_from_slice(record.gender.as_str().as_bytes());
    buf.push(b'\n');
}

#[async_trait]
impl Destination for PgConnection {
    async fn copy_rows(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: &mut dyn RowSource,
    ) -> Result<u64, DestinationError> {
        let statement = copy_statement(table, columns);
        let mut copy = self.copy_in_raw(&statement).await?;
        let mut buf = Vec::with_capacity(COPY_CHUNK_BYTES + 512);

        loop {
            let record = match rows.next_row().await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(err) => {
                    if let Err(abort_err) = copy.abort(err.to_string()).await {
                        log::warn!("failed to abort copy into {}: {}", table, abort_err);
                    }
                    return Err(DestinationError::SourceAborted(err));
                }
            };

            encode_copy_row(&mut buf, &record);
            if buf.len() >= COPY_CHUNK_BYTES {
                copy.send(buf.as_slice()).await?;
                buf.clear();
            }
        }

        if !buf.is_empty() {
            copy.send(buf.as_slice()).await?;
        }
        let copied = copy.finish().await?;
        log::trace!("copy into {} finished with {} rows", table, copied);
        Ok(copied)
    }

    async fn prepare_statement(&mut self, statement: &Statement) -> Result<(), DestinationError> {
        sqlx::Executor::prepare(&mut *self, statement.sql).await?;
        Ok(())
    }

    async fn deallocate_statement(
        &mut self,
        statement: &Statement,
    ) -> Result<(), DestinationError> {
        log::trace!("releasing cached statement {}", statement.name);
        self.clear_cached_statements().await?;
        Ok(())
    }

    async fn execute_batch(
        &mut self,
        statement: &Statement,
        rows: &[Record],
    ) -> Result<u64, DestinationError> {
        let mut tx = self.begin().await?;
        let mut affected = 0;
        for row in rows {
            affected += sqlx::query(statement.sql)
                .bind(row.count)
                .bind(row.name_type)
                .bind(row.text.as_str())
                .bind(row.gender)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn execute_columns(
        &mut self,
        statement: &Statement,
        columns: &ColumnBatch,
    ) -> Result<u64, DestinationError> {
        log::trace!(
            "executing {} with {} rows",
            statement.name,
            columns.counts.len()
        );
        let result = sqlx::query(statement.sql)
            .bind(&columns.counts)
            .bind(&columns.name_types)
            .bind(&columns.texts)
            .bind(&columns.genders)
            .execute(&mut *self)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insert::{NAMES_COLUMNS, NAMES_TABLE};
    use crate::models::{Gender, NameType};

    #[test]
    fn copy_statement_quotes_identifiers() {
        assert_eq!(
            copy_statement(NAMES_TABLE, &NAMES_COLUMNS),
            r#"COPY "names" ("count", "name_type", "name_text", "gender") FROM STDIN"#
        );
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn copy_rows_escape_control_characters() {
        let record = Record {
            count: 42,
            text: "Tab\there\\N\nnew\rline".into(),
            name_type: NameType::Surname,
            gender: Gender::Female,
        };
        let mut buf = Vec::new();
        encode_copy_row(&mut buf, &record);

        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "42\tsurname\tTab\\there\\\\N\\nnew\\rline\tfemale\n"
        );
    }

    #[test]
    fn copy_rows_keep_unicode() {
        let record = Record {
            count: 1,
            text: "Иванов".into(),
            name_type: NameType::Surname,
            gender: Gender::Unknown,
        };
        let mut buf = Vec::new();
        encode_copy_row(&mut buf, &record);
        assert_eq!(String::from_utf8(buf).unwrap(), "1\tsurname\tИванов\tunknown\n");
    }
}
