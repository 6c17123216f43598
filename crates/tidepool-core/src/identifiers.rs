//! Identifier types used throughout the pipeline.
//!
//! Entity identifiers (`ConversationId`, `MessageId`, …) are uuid-backed
//! newtypes, so they cannot be mixed up at call sites. `CapabilityName`
//! is a validated string newtype: capability names come from model
//! output and must be parsed, never trusted.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing uuid.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identifier for a conversation.
    ConversationId
);
uuid_id!(
    /// Identifier for a single message within a conversation.
    MessageId
);
uuid_id!(
    /// Identifier for a resumable stream handle.
    StreamHandleId
);
uuid_id!(
    /// Identifier for a scheduled task.
    TaskId
);
uuid_id!(
    /// Identifier for the owner of a conversation or task.
    UserId
);

/// Maximum length for a capability name.
const MAX_CAPABILITY_NAME_LEN: usize = 64;

/// Validated capability name.
///
/// Names are lowercase ASCII alphanumerics and underscores, non-empty,
/// at most 64 characters. Model output that does not parse as a
/// capability name can never reach the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityName(String);

/// Error returned when a capability name fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidCapabilityName {
    #[error("capability name is empty")]
    Empty,
    #[error("capability name exceeds {MAX_CAPABILITY_NAME_LEN} characters")]
    TooLong,
    #[error("capability name '{name}' contains invalid character '{found}'")]
    InvalidCharacter { name: String, found: char },
}

impl CapabilityName {
    /// Parse and validate a capability name.
    pub fn parse(name: impl AsRef<str>) -> Result<Self, InvalidCapabilityName> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(InvalidCapabilityName::Empty);
        }
        if name.len() > MAX_CAPABILITY_NAME_LEN {
            return Err(InvalidCapabilityName::TooLong);
        }
        if let Some(found) = name
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
        {
            return Err(InvalidCapabilityName::InvalidCharacter {
                name: name.to_string(),
                found,
            });
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for CapabilityName {
    type Error = InvalidCapabilityName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<CapabilityName> for String {
    fn from(name: CapabilityName) -> Self {
        name.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = ConversationId::generate();
        let b = ConversationId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn ids_round_trip_through_display() {
        let id = MessageId::generate();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn capability_name_accepts_snake_case() {
        let name = CapabilityName::parse("web_search").unwrap();
        assert_eq!(name.as_str(), "web_search");
    }

    #[test]
    fn capability_name_rejects_bad_input() {
        assert_eq!(
            CapabilityName::parse(""),
            Err(InvalidCapabilityName::Empty)
        );
        assert_eq!(
            CapabilityName::parse("a".repeat(65)),
            Err(InvalidCapabilityName::TooLong)
        );
        assert!(matches!(
            CapabilityName::parse("Web Search"),
            Err(InvalidCapabilityName::InvalidCharacter { found: 'W', .. })
        ));
    }
}
