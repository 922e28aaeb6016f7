//! Application-level events exchanged on `<prefix>:events`.
//!
//! Payload: `<kind>:<sourceId>:<key>`; the key is the remainder and may
//! contain `:`.

use std::fmt;

use cachet_core::invalidation::MalformedMessage;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedisEventKind {
    /// An item was explicitly removed.
    ItemRemoved,
    /// An item was removed because a dependency was invalidated.
    ItemInvalidated,
    /// A dependency was invalidated.
    DependencyInvalidated,
}

impl RedisEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ItemRemoved => "item-removed",
            Self::ItemInvalidated => "item-invalidated",
            Self::DependencyInvalidated => "dependency-invalidated",
        }
    }

    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "item-removed" => Some(Self::ItemRemoved),
            "item-invalidated" => Some(Self::ItemInvalidated),
            "dependency-invalidated" => Some(Self::DependencyInvalidated),
            _ => None,
        }
    }
}

impl fmt::Display for RedisEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisEvent {
    pub kind: RedisEventKind,
    pub source_id: Uuid,
    pub key: String,
}

impl RedisEvent {
    pub fn new(kind: RedisEventKind, source_id: Uuid, key: impl Into<String>) -> Self {
        Self {
            kind,
            source_id,
            key: key.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.kind, self.source_id, self.key)
    }

    /// # Errors
    ///
    /// Returns the reason the payload was rejected.
    pub fn parse(raw: &str) -> Result<Self, MalformedMessage> {
        let mut fields = raw.splitn(3, ':');
        let kind = field(fields.next(), "kind")?;
        let source_id = field(fields.next(), "source id")?;
        let key = field(fields.next(), "key")?;

        let source_id =
            Uuid::parse_str(source_id).map_err(|_| MalformedMessage::InvalidSourceId(source_id.to_string()))?;
        let kind = RedisEventKind::parse(kind).ok_or_else(|| MalformedMessage::UnknownKind(kind.to_string()))?;
        Ok(Self::new(kind, source_id, key))
    }
}

fn field<'a>(value: Option<&'a str>, name: &'static str) -> Result<&'a str, MalformedMessage> {
    value.filter(|v| !v.is_empty()).ok_or(MalformedMessage::MissingField(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_and_parse() {
        let id = Uuid::new_v4();
        let raw = RedisEvent::new(RedisEventKind::ItemRemoved, id, "a:b").encode();
        assert_eq!(raw, format!("item-removed:{id}:a:b"));
        assert_eq!(
            RedisEvent::parse(&raw).unwrap(),
            RedisEvent::new(RedisEventKind::ItemRemoved, id, "a:b")
        );
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(
            RedisEvent::parse("item-removed:not-a-guid:somekey"),
            Err(MalformedMessage::InvalidSourceId("not-a-guid".into()))
        );
        assert_eq!(
            RedisEvent::parse("item-removed::k"),
            Err(MalformedMessage::MissingField("source id"))
        );
        let id = Uuid::new_v4();
        assert_eq!(
            RedisEvent::parse(&format!("renamed:{id}:k")),
            Err(MalformedMessage::UnknownKind("renamed".into()))
        );
    }
}
