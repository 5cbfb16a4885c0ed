//! Shared tuning vocabulary.
//!
//! These enums are read by configuration, the resource runtime, the
//! performance monitor and the pipeline context, so they live here rather
//! than in any one of those crates.

use serde::{Deserialize, Serialize};

/// Process-wide performance aggressiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceProfile {
    /// Moderate pooling, conservative collection.
    #[default]
    Balanced,
    /// Larger idle sets, adaptive collection.
    High,
    /// Largest idle sets, aggressive collection.
    Extreme,
}

impl PerformanceProfile {
    /// All profiles, least aggressive first.
    pub const ALL: [Self; 3] = [Self::Balanced, Self::High, Self::Extreme];

    /// Returns the lowercase name used in config and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::High => "high",
            Self::Extreme => "extreme",
        }
    }

    /// Encodes the profile for atomic storage.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a value produced by [`as_u8`](Self::as_u8). Unknown values
    /// read as `Balanced`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::High,
            2 => Self::Extreme,
            _ => Self::Balanced,
        }
    }
}

impl std::fmt::Display for PerformanceProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PerformanceProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "balanced" => Ok(Self::Balanced),
            "high" => Ok(Self::High),
            "extreme" => Ok(Self::Extreme),
            other => Err(format!("unknown performance profile '{other}'")),
        }
    }
}

/// Garbage-collection strategy chosen by the memory governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcStrategy {
    /// Collect only at HIGH or CRITICAL pressure.
    Conservative,
    /// Collect proactively from MEDIUM pressure.
    Aggressive,
    /// Conservative until the recent pressure trend climbs.
    Adaptive,
}

impl GcStrategy {
    /// Returns the lowercase name used in config and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Aggressive => "aggressive",
            Self::Adaptive => "adaptive",
        }
    }
}

impl std::fmt::Display for GcStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GcStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "aggressive" => Ok(Self::Aggressive),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(format!("unknown gc strategy '{other}'")),
        }
    }
}

/// Qualitative bucket for memory utilisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PressureLevel {
    /// Below the medium band.
    #[default]
    Low,
    /// Between the medium and high bands.
    Medium,
    /// Between the high and critical bands.
    High,
    /// At or above the critical band.
    Critical,
}

impl PressureLevel {
    /// Encodes the level for atomic storage and gauges.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a value produced by [`as_u8`](Self::as_u8); out-of-range
    /// values saturate to `Critical`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Low,
            1 => Self::Medium,
            2 => Self::High,
            _ => Self::Critical,
        }
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        })
    }
}
