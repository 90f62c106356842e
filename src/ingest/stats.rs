//! Per-stage rejection counters.
//!
//! Both accumulators are plain owned state of a single parser or scanner.
//! They are never shared between concurrent runs; the orchestration layer
//! reads them once the run is over.

use serde::Serialize;

/// Rejections counted by the line parser, one field per rejection class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParserStats {
    pub invalid_json: usize,
    pub empty_record: usize,
    pub invalid_name: usize,
    pub invalid_gender: usize,
    pub invalid_count: usize,
}

impl ParserStats {
    /// Total number of lines the parser refused.
    pub fn rejected(&self) -> usize {
        self.invalid_json
            + self.empty_record
            + self.invalid_name
            + self.invalid_gender
            + self.invalid_count
    }

    pub fn merge(&mut self, other: ParserStats) {
        self.invalid_json += other.invalid_json;
        self.empty_record += other.empty_record;
        self.invalid_name += other.invalid_name;
        self.invalid_gender += other.invalid_gender;
        self.invalid_count += other.invalid_count;
    }
}

/// Line accounting for one scan: `total == unparsed + invalid + valid`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScannerStats {
    #[serde(rename = "total")]
    pub total_lines: usize,
    pub unparsed: usize,
    pub invalid: usize,
    pub valid: usize,
}

impl ScannerStats {
    pub fn merge(&mut self, other: ScannerStats) {
        self.total_lines += other.total_lines;
        self.unparsed += other.unparsed;
        self.invalid += other.invalid;
        self.valid += other.valid;
    }
}
