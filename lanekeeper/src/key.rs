//! Resource keys
//!
//! A key names one logical partition of shared state: a user record, a guild
//! record, or one of the global partitions. Keys are compared by their
//! canonical string form, which gives the total order used by the
//! coordinator to acquire several lanes without deadlocking.
//!
//! Segments are restricted to `[A-Za-z0-9_-]` and joined by `:`, so a key
//! string has exactly one parse and maps to exactly one storage path.

use std::fmt;

pub const SEPARATOR: char = ':';

/// Errors produced when building a key from untrusted input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key or one of its segments is empty
    EmptySegment(String),
    /// A segment contains a character outside `[A-Za-z0-9_-]`
    InvalidChar { key: String, ch: char },
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySegment(key) => write!(f, "Empty segment in resource key '{key}'"),
            Self::InvalidChar { key, ch } => {
                write!(f, "Invalid character {ch:?} in resource key '{key}'")
            }
        }
    }
}

impl std::error::Error for KeyError {}

/// Global partitions of shared state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GlobalPartition {
    Items,
    Leaderboards,
    BannedUsers,
    Powerups,
    Quest,
    WipeUsers,
}

impl GlobalPartition {
    pub const ALL: [GlobalPartition; 6] = [
        Self::Items,
        Self::Leaderboards,
        Self::BannedUsers,
        Self::Powerups,
        Self::Quest,
        Self::WipeUsers,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Items => "items",
            Self::Leaderboards => "leaderboards",
            Self::BannedUsers => "bans",
            Self::Powerups => "powerups",
            Self::Quest => "quest",
            Self::WipeUsers => "wipe_users",
        }
    }
}

/// Identifier of one logical partition of shared state
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Parse and validate a key string such as `user:123`
    ///
    /// # Errors
    /// Returns `KeyError` if any segment is empty or contains a character
    /// outside `[A-Za-z0-9_-]`.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        for segment in key.split(SEPARATOR) {
            validate_segment(key, segment)?;
        }
        Ok(Self(key.to_string()))
    }

    /// Build a key from segments
    ///
    /// # Errors
    /// Same rules as [`ResourceKey::parse`].
    pub fn from_segments<I, S>(segments: I) -> Result<Self, KeyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = segments
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(":");
        Self::parse(&joined)
    }

    /// `user:<id>`
    ///
    /// # Errors
    /// Returns `KeyError` if `id` is not a valid segment.
    pub fn user(id: &str) -> Result<Self, KeyError> {
        Self::from_segments(["user", id])
    }

    /// `guild:<id>`
    ///
    /// # Errors
    /// Returns `KeyError` if `id` is not a valid segment.
    pub fn guild(id: &str) -> Result<Self, KeyError> {
        Self::from_segments(["guild", id])
    }

    /// `global:<partition>`
    #[must_use]
    pub fn global(partition: GlobalPartition) -> Self {
        Self(format!("global{SEPARATOR}{}", partition.name()))
    }

    /// `global:market:<item>`
    ///
    /// # Errors
    /// Returns `KeyError` if `item_id` is not a valid segment.
    pub fn market(item_id: &str) -> Result<Self, KeyError> {
        Self::from_segments(["global", "market", item_id])
    }

    /// `global:leaderboard:<board>`
    ///
    /// # Errors
    /// Returns `KeyError` if `board_id` is not a valid segment.
    pub fn leaderboard(board_id: &str) -> Result<Self, KeyError> {
        Self::from_segments(["global", "leaderboard", board_id])
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// True if the leading segments of this key equal `prefix`'s segments
    #[must_use]
    pub fn has_prefix(&self, prefix: &[&str]) -> bool {
        let mut own = self.segments();
        prefix.iter().all(|p| own.next() == Some(*p))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for ResourceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn validate_segment(key: &str, segment: &str) -> Result<(), KeyError> {
    if segment.is_empty() {
        return Err(KeyError::EmptySegment(key.to_string()));
    }
    if let Some(ch) = segment
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(KeyError::InvalidChar {
            key: key.to_string(),
            ch,
        });
    }
    Ok(())
}
