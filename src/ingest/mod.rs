//! Record production: raw lines to validated [`Record`](crate::models::Record)s.
//!
//! 1. **Count decoding** (`number_long`) - tolerant `count` field formats
//! 2. **Parsing** (`parser`) - one JSON line into a parsed name, rejections classified
//! 3. **Scanning** (`scanner`) - lazy, cancellable iteration over a byte stream
//! 4. **Statistics** (`stats`) - per-stage counters owned by each instance

pub mod number_long;
pub mod parser;
pub mod scanner;
pub mod stats;

pub use parser::{LineParser, ParseError, Parser, ParserOptions};
pub use scanner::{Records, ScanError, Scanner, ScannerOptions};
pub use stats::{ParserStats, ScannerStats};
