//! Portable classification of store integrity errors.
//!
//! Callers implementing idempotent inserts or guarded deletes branch on [`ErrorKind`]
//! instead of matching on a particular driver's error type.

use crate::error::{DbError, ErrorCode};

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use tokio_postgres::error::SqlState;

/// MySQL `ER_DUP_ENTRY`.
const MYSQL_DUP_ENTRY: u16 = 1062;
/// MySQL `ER_ROW_IS_REFERENCED_2`: parent row delete/update blocked by a child.
const MYSQL_ROW_IS_REFERENCED: u16 = 1451;
/// MySQL `ER_NO_REFERENCED_ROW_2`: child row references a missing parent.
const MYSQL_NO_REFERENCED_ROW: u16 = 1452;

/// Semantic outcome of a store error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unique-constraint violation.
    DuplicateKey,
    /// Referential-integrity violation.
    ForeignKeyViolation,
    /// Anything else, including no error at all.
    Unclassified,
}

/// How a store family represents its error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Symbolic SQLSTATE codes.
    #[default]
    Postgres,
    /// Numeric server error numbers.
    MySql,
}

impl Dialect {
    /// Map a code to a kind. Codes in the other dialect's representation never match.
    pub fn kind_of(&self, code: &ErrorCode) -> ErrorKind {
        match (self, code) {
            (Self::Postgres, ErrorCode::Sqlstate(state)) => {
                if state == SqlState::UNIQUE_VIOLATION.code() {
                    ErrorKind::DuplicateKey
                } else if state == SqlState::FOREIGN_KEY_VIOLATION.code() {
                    ErrorKind::ForeignKeyViolation
                } else {
                    ErrorKind::Unclassified
                }
            }
            (Self::MySql, ErrorCode::Numeric(number)) => match *number {
                MYSQL_DUP_ENTRY => ErrorKind::DuplicateKey,
                MYSQL_ROW_IS_REFERENCED | MYSQL_NO_REFERENCED_ROW => ErrorKind::ForeignKeyViolation,
                _ => ErrorKind::Unclassified,
            },
            _ => ErrorKind::Unclassified,
        }
    }
}

/// Classifies errors for one active dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier {
    dialect: Dialect,
}

impl ErrorClassifier {
    /// Create a classifier for the given dialect.
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// The active dialect.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Classify an error.
    ///
    /// Walks the `source()` chain and decides on the first store code found. `None`
    /// and errors without a recognizable store code are [`ErrorKind::Unclassified`].
    pub fn classify(&self, err: Option<&(dyn StdError + 'static)>) -> ErrorKind {
        let mut current = err;
        while let Some(e) = current {
            if let Some(code) = store_code(e) {
                return self.dialect.kind_of(&code);
            }
            current = e.source();
        }
        ErrorKind::Unclassified
    }

    /// Classify one of this crate's errors.
    pub fn classify_db(&self, err: Option<&DbError>) -> ErrorKind {
        self.classify(err.map(|e| e as &(dyn StdError + 'static)))
    }

    /// True iff `err` carries the active dialect's unique-violation code.
    pub fn is_duplicate_key(&self, err: Option<&(dyn StdError + 'static)>) -> bool {
        self.classify(err) == ErrorKind::DuplicateKey
    }

    /// True iff `err` carries the active dialect's referential-integrity code.
    pub fn is_foreign_key_violation(&self, err: Option<&(dyn StdError + 'static)>) -> bool {
        self.classify(err) == ErrorKind::ForeignKeyViolation
    }
}

fn store_code(e: &(dyn StdError + 'static)) -> Option<ErrorCode> {
    if let Some(db) = e.downcast_ref::<DbError>() {
        return db.code().cloned();
    }
    if let Some(pg) = e.downcast_ref::<tokio_postgres::Error>() {
        return pg.code().map(|state| ErrorCode::sqlstate(state.code()));
    }
    if let Some(pg) = e.downcast_ref::<tokio_postgres::error::DbError>() {
        return Some(ErrorCode::sqlstate(pg.code().code()));
    }
    None
}
