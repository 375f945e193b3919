//! Identifier newtypes

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique client identifier, assigned by the relay for the lifetime of one
/// connection. This is the address users exchange out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Uppercase UUID form, the shape shown to users
    pub fn to_display_string(&self) -> String {
        self.0.to_string().to_uppercase()
    }

    /// Parse user input, tolerating case and missing hyphens
    pub fn from_display_string(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        if let Ok(uuid) = Uuid::parse_str(trimmed) {
            return Some(Self(uuid));
        }

        let cleaned: String = trimmed.chars().filter(|c| c.is_alphanumeric()).collect();
        if cleaned.len() != 32 {
            return None;
        }
        Uuid::parse_str(&cleaned.to_lowercase()).ok().map(Self)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

/// Unique chat session identifier, minted by the relay when a handshake
/// completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique message identifier, minted by the relay when it stamps a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
