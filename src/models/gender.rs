use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::NameType;

/// Gender attached to a name occurrence.
///
/// Stored in the `gender_enum` Postgres type using the lowercase labels.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "gender_enum", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    #[default]
    Unknown,
    Male,
    Female,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid gender {0:?}")]
pub struct InvalidGender(pub String);

impl Gender {
    pub const ALL: [Gender; 3] = [Gender::Unknown, Gender::Male, Gender::Female];

    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Unknown => "unknown",
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }

    /// Guess the gender of a surname or patronymic from its Russian suffix.
    ///
    /// Female suffixes are tested first since most of them extend a male one
    /// (`-ова` / `-ов`). First names carry no reliable suffix and always yield
    /// `Unknown`.
    pub fn infer(text: &str, name_type: NameType) -> Gender {
        let name = text.trim().to_lowercase();
        let ends_with_any = |suffixes: &[&str]| suffixes.iter().any(|s| name.ends_with(s));

        match name_type {
            NameType::Surname => {
                if ends_with_any(&["ова", "ева", "ёва", "вна", "ина", "ына", "ая", "яя"]) {
                    Gender::Female
                } else if ends_with_any(&["ов", "ев", "ёв", "ин", "ын", "ой", "ий", "ый"]) {
                    Gender::Male
                } else {
                    Gender::Unknown
                }
            }
            NameType::Patronymic => {
                if ends_with_any(&["овна", "евна", "ична", "инична"]) {
                    Gender::Female
                } else if ends_with_any(&["ович", "евич", "ич"]) {
                    Gender::Male
                } else {
                    Gender::Unknown
                }
            }
            NameType::Name => Gender::Unknown,
        }
    }
}

impl sqlx::postgres::PgHasArrayType for Gender {
    fn array_type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("_gender_enum")
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = InvalidGender;

    /// Accepts the export aliases: `m`/`M`/`male`, `f`/`F`/`female` and
    /// empty/`u`/`U`/`unknown`. Long forms are case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "m" | "M" => return Ok(Gender::Male),
            "f" | "F" => return Ok(Gender::Female),
            "" | "u" | "U" => return Ok(Gender::Unknown),
            _ => {}
        }

        if s.eq_ignore_ascii_case("male") {
            Ok(Gender::Male)
        } else if s.eq_ignore_ascii_case("female") {
            Ok(Gender::Female)
        } else if s.eq_ignore_ascii_case("unknown") {
            Ok(Gender::Unknown)
        } else {
            Err(InvalidGender(s.to_string()))
        }
    }
}
