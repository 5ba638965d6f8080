#![forbid(unsafe_code)]

use rusqlite::ErrorCode;

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    Validation {
        op: &'static str,
        chunk_id: Option<String>,
        constraint: String,
    },
    NotFound {
        op: &'static str,
        /// Which reference failed to resolve: "chunk", "parent", "page", "ref" or "tag".
        role: &'static str,
        chunk_id: String,
    },
    AlreadyExists {
        chunk_id: String,
    },
    Cycle {
        chunk_id: String,
        new_parent_id: String,
    },
    DepthLimit {
        chunk_id: String,
        depth: usize,
        max_depth: usize,
    },
    HasChildren {
        chunk_id: String,
        children: usize,
    },
    RevisionMismatch {
        chunk_id: String,
        expected: i64,
        actual: i64,
    },
    Transaction {
        op: &'static str,
        attempts: u32,
        source: rusqlite::Error,
    },
    Consistency {
        chunk_id: String,
        mismatch_type: &'static str,
    },
    Batch {
        index: usize,
        source: Box<StoreError>,
    },
}

impl StoreError {
    pub(crate) fn validation(
        op: &'static str,
        chunk_id: Option<&str>,
        constraint: impl Into<String>,
    ) -> Self {
        Self::Validation {
            op,
            chunk_id: chunk_id.map(str::to_string),
            constraint: constraint.into(),
        }
    }

    pub(crate) fn not_found(op: &'static str, role: &'static str, chunk_id: &str) -> Self {
        Self::NotFound {
            op,
            role,
            chunk_id: chunk_id.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "IO",
            Self::Sql(_) => "SQL",
            Self::Validation { .. } => "VALIDATION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::Cycle { .. } => "CYCLE",
            Self::DepthLimit { .. } => "DEPTH_LIMIT",
            Self::HasChildren { .. } => "HAS_CHILDREN",
            Self::RevisionMismatch { .. } => "REVISION_MISMATCH",
            Self::Transaction { .. } => "TRANSACTION",
            Self::Consistency { .. } => "CONSISTENCY",
            Self::Batch { .. } => self.root().code(),
        }
    }

    /// True only for transient lock contention; application errors never retry.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::Sql(err) => is_busy(err),
            _ => false,
        }
    }

    /// Strips batch wrapping.
    pub fn root(&self) -> &StoreError {
        match self {
            Self::Batch { source, .. } => source.root(),
            other => other,
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => matches!(
            code.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::Validation {
                op,
                chunk_id,
                constraint,
            } => match chunk_id {
                Some(chunk_id) => write!(
                    f,
                    "{op}: validation failed (chunk_id={chunk_id}): {constraint}"
                ),
                None => write!(f, "{op}: validation failed: {constraint}"),
            },
            Self::NotFound { op, role, chunk_id } => {
                write!(f, "{op}: {role} not found (chunk_id={chunk_id})")
            }
            Self::AlreadyExists { chunk_id } => {
                write!(f, "chunk already exists (chunk_id={chunk_id})")
            }
            Self::Cycle {
                chunk_id,
                new_parent_id,
            } => write!(
                f,
                "hierarchy cycle (chunk_id={chunk_id}, new_parent_id={new_parent_id})"
            ),
            Self::DepthLimit {
                chunk_id,
                depth,
                max_depth,
            } => write!(
                f,
                "hierarchy depth limit exceeded (chunk_id={chunk_id}, depth={depth}, max_depth={max_depth})"
            ),
            Self::HasChildren { chunk_id, children } => write!(
                f,
                "chunk has children (chunk_id={chunk_id}, children={children})"
            ),
            Self::RevisionMismatch {
                chunk_id,
                expected,
                actual,
            } => write!(
                f,
                "revision mismatch (chunk_id={chunk_id}, expected={expected}, actual={actual})"
            ),
            Self::Transaction {
                op,
                attempts,
                source,
            } => write!(
                f,
                "{op}: transaction failed after {attempts} attempts: {source}"
            ),
            Self::Consistency {
                chunk_id,
                mismatch_type,
            } => write!(
                f,
                "consistency error (chunk_id={chunk_id}, mismatch_type={mismatch_type})"
            ),
            Self::Batch { index, source } => write!(f, "batch item {index}: {source}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Sql(err) => Some(err),
            Self::Transaction { source, .. } => Some(source),
            Self::Batch { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}
