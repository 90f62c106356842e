//! Line parsing: one JSON object per line into a [`ParsedName`].
//!
//! The input mirrors a document-store export. Only `count`, `text` and
//! `gender` end up in the record; `fname`, `f_form`, `m_form` and `ethnic`
//! are read solely to spot records that carry no useful information.
//!
//! # Rejection order
//!
//! 1. JSON decode failure (`invalid_json`)
//! 2. Sparse record: `count == 1` and every optional field absent or empty
//!    (`empty_record`, can be switched off through [`ParserOptions`])
//! 3. Text refused by the [`TextPolicy`] (`invalid_name`)
//! 4. Gender outside the alias table (`invalid_gender`)
//! 5. Count outside `[1, i32::MAX]` (`invalid_count`)
//!
//! A [`Parser`] owns its statistics and is not meant to be shared: give each
//! concurrent ingestion its own instance.

use serde::Deserialize;
use serde::de::IgnoredAny;
use std::borrow::Cow;
use std::sync::Arc;
use thiserror::Error;

use crate::ingest::number_long::NumberLong;
use crate::ingest::stats::ParserStats;
use crate::models::{Gender, InvalidGender, ParsedName, TextError, TextPolicy, TrimmedText};

/// Errors returned for a single rejected line.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("too little data")]
    EmptyRecord,
    #[error("invalid text: {0}")]
    InvalidName(TextError),
    #[error("invalid gender: {0}")]
    InvalidGender(InvalidGender),
    #[error("count must be in [1..{max}], got {0}", max = i32::MAX)]
    InvalidCount(i64),
}

/// Anything able to turn one raw line into a [`ParsedName`].
pub trait LineParser: Send {
    fn parse(&mut self, line: &[u8]) -> Result<ParsedName, ParseError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ParserOptions {
    /// Drop records that look like export garbage (see module docs).
    pub reject_sparse: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            reject_sparse: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRecord<'a> {
    #[serde(default)]
    count: NumberLong,
    #[serde(default, borrow)]
    text: Option<Cow<'a, str>>,
    #[serde(default, borrow)]
    gender: Option<Cow<'a, str>>,
    #[serde(default, borrow)]
    fname: Option<Cow<'a, str>>,
    #[serde(default, borrow)]
    f_form: Option<Cow<'a, str>>,
    #[serde(default, borrow)]
    m_form: Option<Cow<'a, str>>,
    #[serde(default)]
    ethnic: Option<Vec<IgnoredAny>>,
}

fn is_blank(field: &Option<Cow<'_, str>>) -> bool {
    field.as_deref().is_none_or(str::is_empty)
}

impl RawRecord<'_> {
    fn is_sparse(&self) -> bool {
        self.count.0 == 1
            && is_blank(&self.gender)
            && is_blank(&self.fname)
            && is_blank(&self.f_form)
            && is_blank(&self.m_form)
            && self.ethnic.as_ref().is_none_or(Vec::is_empty)
    }
}

/// Export-format line parser with per-class rejection counters.
pub struct Parser {
    options: ParserOptions,
    policy: Arc<dyn TextPolicy>,
    stats: ParserStats,
}

impl Parser {
    pub fn new(options: ParserOptions, policy: Arc<dyn TextPolicy>) -> Self {
        Self {
            options,
            policy,
            stats: ParserStats::default(),
        }
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(ParserOptions::default(), Arc::new(TrimmedText))
    }
}

impl LineParser for Parser {
    fn parse(&mut self, line: &[u8]) -> Result<ParsedName, ParseError> {
        let raw: RawRecord<'_> = match serde_json::from_slice(line) {
            Ok(raw) => raw,
            Err(err) => {
                self.stats.invalid_json += 1;
                return Err(ParseError::Decode(err));
            }
        };

        if self.options.reject_sparse && raw.is_sparse() {
            self.stats.empty_record += 1;
            return Err(ParseError::EmptyRecord);
        }

        let text = match self.policy.normalize(raw.text.as_deref().unwrap_or_default()) {
            Ok(text) => text,
            Err(err) => {
                self.stats.invalid_name += 1;
                return Err(ParseError::InvalidName(err));
            }
        };

        let gender = match raw.gender.as_deref().unwrap_or_default().parse::<Gender>() {
            Ok(gender) => gender,
            Err(err) => {
                self.stats.invalid_gender += 1;
                return Err(ParseError::InvalidGender(err));
            }
        };

        let count = match i32::try_from(raw.count.0) {
            Ok(count) if count >= 1 => count,
            _ => {
                self.stats.invalid_count += 1;
                return Err(ParseError::InvalidCount(raw.count.0));
            }
        };

        Ok(ParsedName {
            count,
            text,
            gender,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NameType;

    fn parse(line: &str) -> (Result<ParsedName, ParseError>, ParserStats) {
        let mut parser = Parser::default();
        let result = parser.parse(line.as_bytes());
        (result, parser.stats())
    }

    #[test]
    fn parses_plain_record() {
        let (result, stats) = parse(r#"{"count":5,"text":" Ivanov ","gender":"m"}"#);
        let name = result.unwrap();
        assert_eq!(name.count, 5);
        assert_eq!(name.text, "Ivanov");
        assert_eq!(name.gender, Gender::Male);
        assert_eq!(stats, ParserStats::default());
    }

    #[test]
    fn quoted_count_and_female_alias() {
        let (result, _) = parse(r#"{"count":"12","text":"Anna","gender":"f"}"#);
        let name = result.unwrap();
        assert_eq!(name.count, 12);
        assert_eq!(name.gender, Gender::Female);
    }

    #[test]
    fn wrapped_count_decodes() {
        let (result, _) = parse(r#"{"count":{"$numberLong":"77"},"text":"Petrov","gender":""}"#);
        let name = result.unwrap();
        assert_eq!(name.count, 77);
        assert_eq!(name.gender, Gender::Unknown);
    }

    #[test]
    fn all_count_encodings_agree() {
        let lines = [
            r#"{"count":40,"text":"Sidorov","gender":"m"}"#,
            r#"{"count":"40","text":"Sidorov","gender":"m"}"#,
            r#"{"count":{"$numberLong":"40"},"text":"Sidorov","gender":"m"}"#,
        ];
        let parsed: Vec<_> = lines.iter().map(|l| parse(l).0.unwrap()).collect();
        assert!(parsed.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn sparse_record_is_rejected() {
        let (result, stats) = parse(r#"{"count":1}"#);
        assert!(matches!(result, Err(ParseError::EmptyRecord)));
        assert_eq!(stats.empty_record, 1);
        assert_eq!(stats.rejected(), 1);
    }

    #[test]
    fn sparse_heuristic_needs_every_field_blank() {
        let (result, _) = parse(r#"{"count":1,"text":"Ivanov","ethnic":["ru"]}"#);
        assert!(result.is_ok());
        let (result, _) = parse(r#"{"count":1,"text":"Ivanov","f_form":"Ivanova"}"#);
        assert!(result.is_ok());
        let (result, _) = parse(r#"{"count":1,"text":"Ivanov","ethnic":[],"fname":""}"#);
        assert!(matches!(result, Err(ParseError::EmptyRecord)));
        let (result, _) = parse(r#"{"count":2,"text":"Ivanov"}"#);
        assert!(result.is_ok());
    }

    #[test]
    fn sparse_heuristic_can_be_disabled() {
        let mut parser = Parser::new(
            ParserOptions {
                reject_sparse: false,
            },
            Arc::new(TrimmedText),
        );
        let name = parser.parse(br#"{"count":1,"text":"Ivanov"}"#).unwrap();
        assert_eq!(name.count, 1);
        assert_eq!(parser.stats().empty_record, 0);
    }

    #[test]
    fn classifies_each_rejection() {
        let mut parser = Parser::default();
        let lines = [
            "not json",
            "",
            r#"{"count":3,"text":"   ","gender":"m"}"#,
            r#"{"count":3,"text":"Ivanov","gender":"x"}"#,
            r#"{"count":0,"text":"Ivanov","gender":"m"}"#,
            r#"{"count":-5,"text":"Ivanov","gender":"m"}"#,
        ];
        for line in lines {
            assert!(parser.parse(line.as_bytes()).is_err(), "{line:?} should fail");
        }
        let stats = parser.stats();
        assert_eq!(stats.invalid_json, 2);
        assert_eq!(stats.invalid_name, 1);
        assert_eq!(stats.invalid_gender, 1);
        assert_eq!(stats.invalid_count, 2);
    }

    #[test]
    fn count_bounds() {
        let (ok, _) = parse(r#"{"count":2147483647,"text":"Ivanov","gender":"m"}"#);
        assert_eq!(ok.unwrap().count, i32::MAX);

        let (err, stats) = parse(r#"{"count":2147483648,"text":"Ivanov","gender":"m"}"#);
        assert!(matches!(err, Err(ParseError::InvalidCount(2147483648))));
        assert_eq!(stats.invalid_count, 1);

        let (err, stats) = parse(r#"{"count":0,"text":"Ivanov","gender":"m"}"#);
        assert!(matches!(err, Err(ParseError::InvalidCount(0))));
        assert_eq!(stats.invalid_count, 1);
    }

    #[test]
    fn null_count_is_out_of_range() {
        let (err, stats) = parse(r#"{"count":null,"text":"Ivanov","gender":"m"}"#);
        assert!(matches!(err, Err(ParseError::InvalidCount(0))));
        assert_eq!(stats.invalid_count, 1);
    }

    #[test]
    fn escaped_text_is_decoded() {
        let (result, _) = parse(r#"{"count":2,"text":"\u0418\u0432\u0430\u043d","gender":"M"}"#);
        assert_eq!(result.unwrap().text, "Иван");
    }

    #[test]
    fn parsing_is_repeatable() {
        let line = br#"{"count":9,"text":"Smirnov","gender":"male"}"#;
        let first = Parser::default().parse(line).unwrap();
        let second = Parser::default().parse(line).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn parsed_records_revalidate() {
        let lines = [
            r#"{"count":5,"text":" Ivanov ","gender":"m"}"#,
            r#"{"count":"2147483647","text":"X","gender":"u"}"#,
            r#"{"count":{"$numberLong":"3"},"text":"\tAnna\n","gender":"FEMALE"}"#,
        ];
        let mut parser = Parser::default();
        for line in lines {
            let record = parser
                .parse(line.as_bytes())
                .unwrap()
                .with_type(NameType::Surname);
            assert!(record.validate(&TrimmedText).is_ok(), "{record:?}");
        }
    }
}
