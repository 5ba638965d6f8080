#![forbid(unsafe_code)]

pub const MAX_CHUNK_ID_LEN: usize = 128;
pub const INTERNAL_REF_PREFIX: &str = "chunk:";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Validates and trims a caller-supplied id.
    pub fn try_new(value: impl Into<String>) -> Result<Self, ChunkIdError> {
        let value = value.into();
        validate_chunk_id(&value)?;
        Ok(Self(value.trim().to_string()))
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkIdError {
    Empty,
    TooLong,
    ContainsPipe,
    ContainsControl,
}

impl ChunkIdError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "chunk id must not be empty",
            Self::TooLong => "chunk id is too long",
            Self::ContainsPipe => "chunk id must not contain '|'",
            Self::ContainsControl => "chunk id contains control characters",
        }
    }
}

fn validate_chunk_id(value: &str) -> Result<(), ChunkIdError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ChunkIdError::Empty);
    }
    if trimmed.len() > MAX_CHUNK_ID_LEN {
        return Err(ChunkIdError::TooLong);
    }
    if trimmed.contains('|') {
        return Err(ChunkIdError::ContainsPipe);
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(ChunkIdError::ContainsControl);
    }
    Ok(())
}

/// Classified form of a chunk's `ref` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkReference {
    /// `chunk:<id>`; must resolve to an existing chunk.
    Internal(ChunkId),
    External(String),
}

impl ChunkReference {
    pub fn parse(value: &str) -> Result<Self, ChunkReferenceError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ChunkReferenceError::Empty);
        }
        if trimmed.chars().any(|c| c.is_control()) {
            return Err(ChunkReferenceError::ContainsControl);
        }
        match trimmed.strip_prefix(INTERNAL_REF_PREFIX) {
            Some(raw) => ChunkId::try_new(raw)
                .map(Self::Internal)
                .map_err(ChunkReferenceError::InvalidChunkId),
            None => Ok(Self::External(trimmed.to_string())),
        }
    }

    pub fn internal_id(&self) -> Option<&ChunkId> {
        match self {
            Self::Internal(id) => Some(id),
            Self::External(_) => None,
        }
    }

    pub fn to_stored(&self) -> String {
        match self {
            Self::Internal(id) => format!("{INTERNAL_REF_PREFIX}{id}"),
            Self::External(uri) => uri.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkReferenceError {
    Empty,
    ContainsControl,
    InvalidChunkId(ChunkIdError),
}

impl ChunkReferenceError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "ref must not be empty",
            Self::ContainsControl => "ref contains control characters",
            Self::InvalidChunkId(err) => err.message(),
        }
    }
}

pub fn internal_ref(chunk_id: &str) -> String {
    format!("{INTERNAL_REF_PREFIX}{chunk_id}")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataKeyError {
    Empty,
    TooLong,
    InvalidChar { ch: char, index: usize },
}

impl MetadataKeyError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "metadata key must not be empty",
            Self::TooLong => "metadata key is too long",
            Self::InvalidChar { .. } => "metadata key may only contain [A-Za-z0-9._-]",
        }
    }
}

/// Keys usable in metadata filters; they are spliced into a JSON path.
pub fn validate_metadata_key(value: &str) -> Result<(), MetadataKeyError> {
    if value.is_empty() {
        return Err(MetadataKeyError::Empty);
    }
    if value.len() > 128 {
        return Err(MetadataKeyError::TooLong);
    }
    for (index, ch) in value.chars().enumerate() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            continue;
        }
        return Err(MetadataKeyError::InvalidChar { ch, index });
    }
    Ok(())
}
