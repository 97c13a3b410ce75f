//! Identifier types for runtime entities.
//!
//! Frames and scopes live in arenas owned by the runtime; the rest of the
//! crate refers to them through these typed keys. A stale id resolves to
//! nothing rather than to a recycled record, which is what makes
//! halt-while-executing and late external resumes safe.

use crate::util::SlotKey;
use core::fmt;
use std::ops::Add;
use std::time::Duration;

/// Identifier of a frame (one running computation instance).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub(crate) SlotKey);

impl FrameId {
    pub(crate) const fn from_slot(key: SlotKey) -> Self {
        Self(key)
    }

    pub(crate) const fn slot(self) -> SlotKey {
        self.0
    }

    /// Fabricates an id for unit tests that only need a distinct value.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(index: u32, generation: u32) -> Self {
        Self(SlotKey::new(index, generation))
    }
}

impl fmt::Debug for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameId({}:{})", self.0.index(), self.0.generation())
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0.index())
    }
}

/// Identifier of a scope (one node in the task tree).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId(pub(crate) SlotKey);

impl ScopeId {
    pub(crate) const fn from_slot(key: SlotKey) -> Self {
        Self(key)
    }

    pub(crate) const fn slot(self) -> SlotKey {
        self.0
    }

    /// Fabricates an id for unit tests that only need a distinct value.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(index: u32, generation: u32) -> Self {
        Self(SlotKey::new(index, generation))
    }
}

impl fmt::Debug for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScopeId({}:{})", self.0.index(), self.0.generation())
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0.index())
    }
}

/// A logical timestamp in nanoseconds.
///
/// Under the monotonic clock this tracks elapsed wall time since the
/// runtime started; under the virtual clock it advances only when the
/// test driver says so.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The runtime epoch.
    pub const ZERO: Self = Self(0);

    /// Creates a timestamp from nanoseconds since the epoch.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a timestamp from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Nanoseconds since the epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Milliseconds since the epoch, truncated.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Adds nanoseconds, saturating on overflow.
    #[must_use]
    pub const fn saturating_add_nanos(self, nanos: u64) -> Self {
        Self(self.0.saturating_add(nanos))
    }

    /// Nanoseconds from `earlier` to `self`, zero if `self` is earlier.
    #[must_use]
    pub const fn saturating_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        self.saturating_add_nanos(u64::try_from(rhs.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ns)", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000 {
            write!(f, "{}ms", self.0 / 1_000_000)
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_conversions() {
        assert_eq!(Time::from_millis(2).as_nanos(), 2_000_000);
        assert_eq!(Time::from_nanos(1_500_000).as_millis(), 1);
    }

    #[test]
    fn time_duration_add() {
        let t = Time::ZERO + Duration::from_millis(10);
        assert_eq!(t.as_millis(), 10);
    }

    #[test]
    fn time_since_saturates() {
        let early = Time::from_millis(1);
        let late = Time::from_millis(5);
        assert_eq!(late.saturating_since(early), 4_000_000);
        assert_eq!(early.saturating_since(late), 0);
    }

    #[test]
    fn ids_display_compactly() {
        assert_eq!(FrameId::new_for_test(3, 1).to_string(), "F3");
        assert_eq!(ScopeId::new_for_test(9, 0).to_string(), "S9");
    }
}
