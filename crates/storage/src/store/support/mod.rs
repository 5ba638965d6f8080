#![forbid(unsafe_code)]

mod chunk_tx;
mod closure_tx;
mod schema;
mod tag_tx;
mod write_ctx;

pub(super) use chunk_tx::*;
pub(super) use closure_tx::*;
pub(super) use schema::{install_schema, preflight_gate};
pub(super) use tag_tx::*;
pub(super) use write_ctx::*;

use super::StoreError;
use rusqlite::ErrorCode;

pub(super) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}

pub(super) fn rfc3339_now() -> String {
    use time::OffsetDateTime;
    use time::format_description::well_known::Rfc3339;

    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| now_ms().to_string())
}

pub(super) fn to_sqlite_i64(op: &'static str, value: usize) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::validation(op, None, "numeric overflow"))
}

/// `LIMIT` operand; SQLite treats a negative limit as unbounded.
pub(super) fn sql_limit(op: &'static str, limit: Option<usize>) -> Result<i64, StoreError> {
    match limit {
        Some(limit) => to_sqlite_i64(op, limit),
        None => Ok(-1),
    }
}

pub(super) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, message) => {
            code.code == ErrorCode::ConstraintViolation
                || message.as_deref().is_some_and(|value| {
                    value.contains("UNIQUE constraint failed")
                        || value.contains("PRIMARY KEY constraint failed")
                })
        }
        _ => false,
    }
}
