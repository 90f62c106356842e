//! Lazy record production over a line-delimited byte stream.
//!
//! [`Scanner::records`] hands out a single-pass iterator. Every call to
//! `next()` reads as many lines as needed to produce one valid [`Record`];
//! nothing is read ahead or buffered beyond the reader's own buffer. Dropping
//! the iterator, or cancelling the token it was created with, stops reading
//! before the next line.
//!
//! Per-line failures are counted and skipped. A failing read is terminal:
//! the iterator ends and the error is kept on the scanner, so callers must
//! check [`Scanner::error`] once they are done consuming.

use std::io::{self, BufRead};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::ingest::parser::{LineParser, Parser};
use crate::ingest::stats::ScannerStats;
use crate::models::{Gender, NameType, Record, TextPolicy, TrimmedText};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan failed at line {line}: {source}")]
    ReadFailed {
        line: usize,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScannerOptions {
    /// Fill `Unknown` genders from the name suffix (see [`Gender::infer`]).
    pub infer_gender: bool,
}

pub struct Scanner<R, P = Parser> {
    reader: R,
    name_type: NameType,
    parser: P,
    policy: Arc<dyn TextPolicy>,
    options: ScannerOptions,
    stats: ScannerStats,
    error: Option<ScanError>,
    line: Vec<u8>,
    exhausted: bool,
}

impl<R: BufRead> Scanner<R, Parser> {
    /// Scanner with the default parser and text policy.
    pub fn new(reader: R, name_type: NameType) -> Self {
        Self::with_parser(reader, name_type, Parser::default(), Arc::new(TrimmedText))
    }
}

impl<R: BufRead, P: LineParser> Scanner<R, P> {
    pub fn with_parser(
        reader: R,
        name_type: NameType,
        parser: P,
        policy: Arc<dyn TextPolicy>,
    ) -> Self {
        Self {
            reader,
            name_type,
            parser,
            policy,
            options: ScannerOptions::default(),
            stats: ScannerStats::default(),
            error: None,
            line: Vec::with_capacity(256),
            exhausted: false,
        }
    }

    pub fn options(mut self, options: ScannerOptions) -> Self {
        self.options = options;
        self
    }

    /// Start (or continue) the single traversal of the input.
    pub fn records(&mut self, cancel: &CancellationToken) -> Records<'_, R, P> {
        Records {
            scanner: self,
            cancel: cancel.clone(),
        }
    }

    pub fn stats(&self) -> ScannerStats {
        self.stats
    }

    pub fn parser(&self) -> &P {
        &self.parser
    }

    /// Terminal read failure, if the traversal ended on one.
    pub fn error(&self) -> Option<&ScanError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<ScanError> {
        self.error.take()
    }

    /// True once the input hit EOF, a read error or a cancellation.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Read the next line into the scratch buffer, without the line ending.
    /// Returns `false` at EOF or on a read error.
    fn read_line(&mut self) -> bool {
        self.line.clear();
        loop {
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => return false,
                Ok(_) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let line = self.stats.total_lines + 1;
                    log::error!("scan failed at line {}: {}", line, err);
                    self.error = Some(ScanError::ReadFailed { line, source: err });
                    return false;
                }
            }
        }

        if self.line.last() == Some(&b'\n') {
            self.line.pop();
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
        }
        true
    }

    fn next_record(&mut self, cancel: &CancellationToken) -> Option<Record> {
        loop {
            if self.exhausted {
                return None;
            }
            if cancel.is_cancelled() {
                log::warn!("scan stopped after line {}: cancelled", self.stats.total_lines);
                self.exhausted = true;
                return None;
            }
            if !self.read_line() {
                self.exhausted = true;
                return None;
            }

            self.stats.total_lines += 1;
            let line_num = self.stats.total_lines;

            let parsed = match self.parser.parse(&self.line) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.stats.unparsed += 1;
                    log::debug!("skip bad line {}: {}", line_num, err);
                    continue;
                }
            };

            let mut record = parsed.with_type(self.name_type);
            if self.options.infer_gender && record.gender == Gender::Unknown {
                record.gender = Gender::infer(&record.text, record.name_type);
            }

            if let Err(err) = record.validate(self.policy.as_ref()) {
                self.stats.invalid += 1;
                log::debug!("invalid record at line {}: {}", line_num, err);
                continue;
            }

            self.stats.valid += 1;
            return Some(record);
        }
    }
}

/// Borrowing iterator returned by [`Scanner::records`].
pub struct Records<'a, R, P> {
    scanner: &'a mut Scanner<R, P>,
    cancel: CancellationToken,
}

impl<R: BufRead, P: LineParser> Iterator for Records<'_, R, P> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        self.scanner.next_record(&self.cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor, Read};

    const MIXED: &str = concat!(
        "{\"count\":5,\"text\":\" Ivanov \",\"gender\":\"m\"}\n",
        "garbage\n",
        "{\"count\":1}\n",
        "{\"count\":\"12\",\"text\":\"Anna\",\"gender\":\"f\"}\r\n",
        "{\"count\":0,\"text\":\"Zero\",\"gender\":\"m\"}\n",
        "\n",
        "{\"count\":{\"$numberLong\":\"7\"},\"text\":\"Petrova\",\"gender\":\"u\"}",
    );

    /// Rejects records whose text starts with a lowercase letter.
    struct CapitalizedOnly;

    impl TextPolicy for CapitalizedOnly {
        fn normalize(&self, raw: &str) -> Result<String, crate::models::TextError> {
            TrimmedText.normalize(raw)
        }

        fn validate(&self, text: &str) -> Result<(), crate::models::TextError> {
            TrimmedText.validate(text)?;
            if text.chars().next().is_some_and(char::is_lowercase) {
                return Err(crate::models::TextError::Empty);
            }
            Ok(())
        }
    }

    /// Endless stream of identical valid lines.
    struct Endless;

    impl Read for Endless {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let line = b"{\"count\":3,\"text\":\"Kuznetsov\",\"gender\":\"m\"}\n";
            let n = buf.len().min(line.len());
            buf[..n].copy_from_slice(&line[..n]);
            Ok(n)
        }
    }

    /// Yields `good` once, then fails every read.
    struct FailAfter {
        good: Option<Vec<u8>>,
    }

    impl Read for FailAfter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.good.take() {
                Some(data) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "disk gone")),
            }
        }
    }

    #[test]
    fn yields_typed_records() {
        let input = "{\"count\":5,\"text\":\" Ivanov \",\"gender\":\"m\"}\n";
        let mut scanner = Scanner::new(Cursor::new(input), NameType::Surname);
        let records: Vec<Record> = scanner.records(&CancellationToken::new()).collect();

        assert_eq!(
            records,
            vec![Record {
                count: 5,
                text: "Ivanov".into(),
                name_type: NameType::Surname,
                gender: Gender::Male,
            }]
        );
        assert!(scanner.error().is_none());
    }

    #[test]
    fn line_accounting_balances() {
        let mut scanner = Scanner::new(Cursor::new(MIXED), NameType::Name);
        let records: Vec<Record> = scanner.records(&CancellationToken::new()).collect();

        let stats = scanner.stats();
        assert_eq!(stats.total_lines, 7);
        assert_eq!(records.len(), 3);
        assert_eq!(stats.valid, records.len());
        assert_eq!(stats.unparsed, 4);
        assert_eq!(
            stats.total_lines,
            stats.unparsed + stats.invalid + stats.valid
        );
        assert_eq!(scanner.parser().stats().rejected(), stats.unparsed);
        assert_eq!(scanner.parser().stats().empty_record, 1);
        assert_eq!(records[1].count, 12);
        assert_eq!(records[2].text, "Petrova");
    }

    #[test]
    fn policy_rejections_count_as_invalid() {
        let input = concat!(
            "{\"count\":2,\"text\":\"ivanov\",\"gender\":\"m\"}\n",
            "{\"count\":2,\"text\":\"Ivanov\",\"gender\":\"m\"}\n",
        );
        let mut scanner = Scanner::with_parser(
            Cursor::new(input),
            NameType::Surname,
            Parser::default(),
            Arc::new(CapitalizedOnly),
        );
        let records: Vec<Record> = scanner.records(&CancellationToken::new()).collect();

        assert_eq!(records.len(), 1);
        assert_eq!(scanner.stats().invalid, 1);
        assert_eq!(scanner.stats().unparsed, 0);
    }

    #[test]
    fn stops_reading_when_consumer_stops() {
        let mut scanner = Scanner::new(BufReader::new(Endless), NameType::Surname);
        let taken: Vec<Record> = scanner.records(&CancellationToken::new()).take(3).collect();

        assert_eq!(taken.len(), 3);
        assert_eq!(scanner.stats().total_lines, 3);
        assert!(!scanner.is_exhausted());
    }

    #[test]
    fn stops_reading_on_cancel() {
        let cancel = CancellationToken::new();
        let mut scanner = Scanner::new(BufReader::new(Endless), NameType::Surname);
        let mut records = scanner.records(&cancel);

        assert!(records.next().is_some());
        assert!(records.next().is_some());
        cancel.cancel();
        assert!(records.next().is_none());
        assert!(records.next().is_none());
        drop(records);

        assert_eq!(scanner.stats().total_lines, 2);
        assert!(scanner.is_exhausted());
        assert!(scanner.error().is_none());
    }

    #[test]
    fn read_failure_is_kept_for_after_drain() {
        let reader = FailAfter {
            good: Some(b"{\"count\":4,\"text\":\"Orlov\",\"gender\":\"m\"}\n".to_vec()),
        };
        let mut scanner = Scanner::new(BufReader::new(reader), NameType::Surname);
        let records: Vec<Record> = scanner.records(&CancellationToken::new()).collect();

        assert_eq!(records.len(), 1);
        let err = scanner.take_error().expect("read error recorded");
        assert!(matches!(err, ScanError::ReadFailed { line: 2, .. }));
        assert!(scanner.error().is_none());
    }

    #[test]
    fn traversal_is_single_pass() {
        let mut scanner = Scanner::new(Cursor::new(MIXED), NameType::Name);
        let first = scanner.records(&CancellationToken::new()).count();
        let second = scanner.records(&CancellationToken::new()).count();

        assert_eq!(first, 3);
        assert_eq!(second, 0);
        assert_eq!(scanner.stats().total_lines, 7);
    }

    #[test]
    fn infers_gender_when_enabled() {
        let input = "{\"count\":2,\"text\":\"Смирнова\",\"gender\":\"\"}\n";

        let mut plain = Scanner::new(Cursor::new(input), NameType::Surname);
        let record = plain.records(&CancellationToken::new()).next().unwrap();
        assert_eq!(record.gender, Gender::Unknown);

        let mut inferring = Scanner::new(Cursor::new(input), NameType::Surname)
            .options(ScannerOptions { infer_gender: true });
        let record = inferring.records(&CancellationToken::new()).next().unwrap();
        assert_eq!(record.gender, Gender::Female);
    }
}
