//! Heap configuration.
//!
//! Two knobs, both settable through the environment for the process-wide heap:
//! - `MAPALLOC_RECLAIM`: `eager` (default) unmaps an arena the moment its last
//!   slot is freed; `retain` keeps each class's active arena mapped when it
//!   empties, so a class that oscillates around zero live objects does not
//!   map and unmap a page on every call.
//! - `MAPALLOC_POISON`: fill freed slots with a byte pattern and verify it on
//!   reuse. Defaults to on in debug builds and off in release builds.

use serde::Serialize;

/// Environment variable selecting the reclaim policy.
pub const RECLAIM_ENV: &str = "MAPALLOC_RECLAIM";

/// Environment variable toggling freed-slot poisoning.
pub const POISON_ENV: &str = "MAPALLOC_POISON";

/// When an arena whose last slot was freed gives its page back to the OS.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimPolicy {
    /// Unmap every arena as soon as it holds no live slots.
    #[default]
    Eager,
    /// Keep the active arena of each class mapped when it empties.
    /// At most one empty arena per class stays resident until `trim`.
    RetainActive,
}

impl ReclaimPolicy {
    /// Parse from string (case-insensitive). Unknown values fall back to `Eager`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "retain" | "retain_active" | "retain-active" | "lazy" => Self::RetainActive,
            _ => Self::Eager,
        }
    }

    /// Returns true if an emptied active arena stays mapped.
    #[must_use]
    pub const fn retains_active(self) -> bool {
        matches!(self, Self::RetainActive)
    }
}

/// Parse a boolean switch. Returns `None` for values that are not recognized.
#[must_use]
pub fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Tunables for one heap instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapConfig {
    pub reclaim: ReclaimPolicy,
    pub poison_freed: bool,
}

const BITS_RESOLVED: u8 = 0x80;
const BIT_RETAIN: u8 = 0x01;
const BIT_POISON: u8 = 0x02;

impl HeapConfig {
    /// Build-profile default: eager reclaim, poisoning only in debug builds.
    pub const DEFAULT: Self = Self {
        reclaim: ReclaimPolicy::Eager,
        poison_freed: cfg!(debug_assertions),
    };

    #[must_use]
    pub const fn with_reclaim(mut self, reclaim: ReclaimPolicy) -> Self {
        self.reclaim = reclaim;
        self
    }

    #[must_use]
    pub const fn with_poison(mut self, poison_freed: bool) -> Self {
        self.poison_freed = poison_freed;
        self
    }

    /// Resolve a configuration from raw environment values.
    ///
    /// Missing or unparseable values keep the defaults.
    #[must_use]
    pub fn from_env_values(reclaim: Option<&str>, poison: Option<&str>) -> Self {
        let mut config = Self::DEFAULT;
        if let Some(raw) = reclaim {
            config.reclaim = ReclaimPolicy::from_str_loose(raw);
        }
        if let Some(flag) = poison.and_then(parse_flag) {
            config.poison_freed = flag;
        }
        config
    }

    /// Pack into a single byte for atomic caching.
    ///
    /// The result is never 0 and never 0xFF, so callers can use those two
    /// values as "unresolved" and "resolving" sentinels.
    #[must_use]
    pub const fn to_bits(self) -> u8 {
        let mut bits = BITS_RESOLVED;
        if self.reclaim.retains_active() {
            bits |= BIT_RETAIN;
        }
        if self.poison_freed {
            bits |= BIT_POISON;
        }
        bits
    }

    /// Inverse of [`HeapConfig::to_bits`]; `None` for sentinel or garbage bytes.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & BITS_RESOLVED == 0 || bits & !(BITS_RESOLVED | BIT_RETAIN | BIT_POISON) != 0 {
            return None;
        }
        let reclaim = if bits & BIT_RETAIN != 0 {
            ReclaimPolicy::RetainActive
        } else {
            ReclaimPolicy::Eager
        };
        Some(Self {
            reclaim,
            poison_freed: bits & BIT_POISON != 0,
        })
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
