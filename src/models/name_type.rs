use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kind of name a record carries. Assigned per run, not per line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "name_type_enum", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NameType {
    Name,
    Surname,
    Patronymic,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown name type {0:?} (expected one of: name, surname, patronymic)")]
pub struct UnknownNameType(pub String);

impl NameType {
    pub const ALL: [NameType; 3] = [NameType::Name, NameType::Surname, NameType::Patronymic];

    pub fn as_str(self) -> &'static str {
        match self {
            NameType::Name => "name",
            NameType::Surname => "surname",
            NameType::Patronymic => "patronymic",
        }
    }
}

impl sqlx::postgres::PgHasArrayType for NameType {
    fn array_type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("_name_type_enum")
    }
}

impl fmt::Display for NameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NameType {
    type Err = UnknownNameType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "name" | "firstname" => Ok(NameType::Name),
            "surname" | "lastname" => Ok(NameType::Surname),
            "patronymic" | "midname" | "middlename" => Ok(NameType::Patronymic),
            other => Err(UnknownNameType(other.to_string())),
        }
    }
}
