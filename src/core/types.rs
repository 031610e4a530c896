use crate::core::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Chat platform an entity id belongs to.
///
/// Ids are platform-scoped: the same string on two platforms names two
/// unrelated entities, and each platform gets its own directory on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    Discord,
    Telegram,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Twitch, Platform::Discord, Platform::Telegram];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Twitch => "twitch",
            Self::Discord => "discord",
            Self::Telegram => "telegram",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "twitch" => Ok(Self::Twitch),
            "discord" => Ok(Self::Discord),
            "telegram" => Ok(Self::Telegram),
            other => Err(format!("Unknown platform '{}'", other)),
        }
    }
}

/// Identity of one user or channel on one platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub platform: Platform,
    pub id: String,
}

impl EntityKey {
    pub fn new(platform: Platform, id: impl Into<String>) -> Self {
        Self {
            platform,
            id: id.into(),
        }
    }

    /// Rejects ids that cannot be used as a single path segment.
    pub fn validate(&self) -> Result<()> {
        let id = self.id.as_str();
        let bad = id.is_empty()
            || id == "."
            || id == ".."
            || id.contains(['/', '\\', '\0']);
        if bad {
            return Err(StateError::InvalidEntityId(self.id.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.id)
    }
}

/// Decimal schema version stored on user documents.
///
/// Versions only ever increase; `0.0` means "never migrated".
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersion(f64);

impl SchemaVersion {
    pub const ZERO: SchemaVersion = SchemaVersion(0.0);

    pub fn new(version: f64) -> Self {
        Self(version)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0.is_finite() && self.0 > 0.0
    }
}

impl From<f64> for SchemaVersion {
    fn from(version: f64) -> Self {
        Self(version)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.fract() == 0.0 {
            write!(f, "{:.1}", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}
