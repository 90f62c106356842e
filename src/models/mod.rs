//! Domain model for name-frequency records.
//!
//! A [`Record`] is one row of the destination `names` table. Its `name_type`
//! and `gender` map onto the `name_type_enum` and `gender_enum` Postgres types.

pub mod gender;
pub mod name_type;
pub mod record;

pub use gender::{Gender, InvalidGender};
pub use name_type::{NameType, UnknownNameType};
pub use record::{ParsedName, Record, TextError, TextPolicy, TrimmedText, ValidationError};
