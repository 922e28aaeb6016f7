//! Wire format of invalidation messages: `<prefix>:<kind>:<sourceId>:<key>`.
//!
//! The key is the remainder of the string and may itself contain `:`.

use std::fmt;

use uuid::Uuid;

/// What an invalidation message targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationKind {
    Item,
    Dependency,
}

impl InvalidationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Item => "item",
            Self::Dependency => "dependency",
        }
    }

    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "item" => Some(Self::Item),
            "dependency" => Some(Self::Dependency),
            _ => None,
        }
    }
}

impl fmt::Display for InvalidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationMessage {
    pub kind: InvalidationKind,
    pub source_id: Uuid,
    pub key: String,
}

impl InvalidationMessage {
    pub fn new(kind: InvalidationKind, source_id: Uuid, key: impl Into<String>) -> Self {
        Self {
            kind,
            source_id,
            key: key.into(),
        }
    }

    pub fn encode(&self, prefix: &str) -> String {
        format!("{prefix}:{}:{}:{}", self.kind, self.source_id, self.key)
    }
}

/// Why a message under our prefix was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedMessage {
    MissingField(&'static str),
    InvalidSourceId(String),
    UnknownKind(String),
}

impl fmt::Display for MalformedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "missing {field}"),
            Self::InvalidSourceId(id) => write!(f, "cannot parse source id '{id}'"),
            Self::UnknownKind(kind) => write!(f, "unknown kind '{kind}'"),
        }
    }
}

/// Parses a raw message.
///
/// Returns `Ok(None)` when the message belongs to another prefix.
pub fn parse_message(prefix: &str, raw: &str) -> Result<Option<InvalidationMessage>, MalformedMessage> {
    let mut fields = raw.splitn(4, ':');
    if fields.next() != Some(prefix) {
        return Ok(None);
    }

    let kind = non_empty(fields.next(), "kind")?;
    let source_id = non_empty(fields.next(), "source id")?;
    let key = non_empty(fields.next(), "key")?;

    let source_id =
        Uuid::parse_str(source_id).map_err(|_| MalformedMessage::InvalidSourceId(source_id.to_string()))?;
    let kind = InvalidationKind::parse(kind).ok_or_else(|| MalformedMessage::UnknownKind(kind.to_string()))?;

    Ok(Some(InvalidationMessage::new(kind, source_id, key)))
}

fn non_empty<'a>(field: Option<&'a str>, name: &'static str) -> Result<&'a str, MalformedMessage> {
    match field {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(MalformedMessage::MissingField(name)),
    }
}
