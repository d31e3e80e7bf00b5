//! Task priority ranks and named bands.
//!
//! A [`Priority`] is a numeric rank in `[0, 255]` with a strict total order:
//! higher ranks are picked first.  Five ranks are named by [`Band`]; every
//! other rank is a custom priority sitting between bands.  [`Priority::increase`]
//! and [`Priority::decrease`] step between bands and saturate at the endpoints,
//! reporting whether the value actually moved.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Named priority bands, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    /// Best-effort work that can wait indefinitely.
    Unimportant,
    /// Background work.
    Low,
    /// Default priority for most work.
    Medium,
    /// Important work that should jump ahead of the default class.
    High,
    /// Must execute before anything else.
    Critical,
}

/// All bands, ascending by rank.
const BANDS: [Band; 5] = [
    Band::Unimportant,
    Band::Low,
    Band::Medium,
    Band::High,
    Band::Critical,
];

impl Band {
    /// The fixed numeric rank of this band.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Band::Unimportant => 0,
            Band::Low => 64,
            Band::Medium => 128,
            Band::High => 192,
            Band::Critical => 255,
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Band::Unimportant => "unimportant",
            Band::Low => "low",
            Band::Medium => "medium",
            Band::High => "high",
            Band::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A totally-ordered task priority.
///
/// Ordering is by rank alone, so two priorities constructed from the same
/// band always compare equal and a custom rank slots in exactly where its
/// number says it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    /// Construct a priority from a raw rank.
    #[must_use]
    pub const fn from_rank(rank: u8) -> Self {
        Self(rank)
    }

    /// Construct a priority from a named band.
    #[must_use]
    pub const fn from_band(band: Band) -> Self {
        Self(band.rank())
    }

    /// The numeric rank.
    #[must_use]
    pub const fn rank(self) -> u8 {
        self.0
    }

    /// The named band this rank corresponds to, or `None` for a custom rank.
    #[must_use]
    pub fn band(self) -> Option<Band> {
        BANDS.into_iter().find(|band| band.rank() == self.0)
    }

    /// Move to the next band strictly above the current rank.
    ///
    /// Returns whether the value changed.  Saturates at [`Band::Critical`]:
    /// any rank at or above it is left untouched.
    pub fn increase(&mut self) -> bool {
        if self.0 >= Band::Critical.rank() {
            return false;
        }
        match BANDS.into_iter().map(Band::rank).find(|rank| *rank > self.0) {
            Some(rank) => {
                self.0 = rank;
                true
            }
            None => false,
        }
    }

    /// Move to the next band strictly below the current rank.
    ///
    /// Returns whether the value changed.  Saturates at
    /// [`Band::Unimportant`] (rank zero).
    pub fn decrease(&mut self) -> bool {
        if self.0 == 0 {
            return false;
        }
        match BANDS
            .into_iter()
            .rev()
            .map(Band::rank)
            .find(|rank| *rank < self.0)
        {
            Some(rank) => {
                self.0 = rank;
                true
            }
            None => false,
        }
    }
}

impl From<Band> for Priority {
    fn from(band: Band) -> Self {
        Self::from_band(band)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::from_band(Band::Medium)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.band() {
            Some(band) => write!(f, "{band}"),
            None => write!(f, "custom({})", self.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
