//! Terminal outcome of a frame.
//!
//! Every frame ends in exactly one of three states:
//!
//! - `Returned(v)`: the computation finished with a value
//! - `Errored(e)`: the computation failed
//! - `Halted`: the computation was cancelled cooperatively
//!
//! Halting is not an error. A halted child is a normal terminal state for
//! its parent, and a halted frame never surfaces as a failure unless the
//! caller explicitly demanded its value. Outcomes still order by severity
//! (`Returned < Errored < Halted`) for merge decisions during teardown: a
//! cleanup failure may replace a success, and nothing replaces a halt.

use crate::error::{Error, ErrorKind};
use core::fmt;

/// The three-valued terminal state of a frame.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// Finished with a value.
    Returned(T),
    /// Failed with an error.
    Errored(Error),
    /// Cancelled at a suspension boundary.
    Halted,
}

impl<T> Outcome<T> {
    /// Severity rank used when merging outcomes (0 = returned, 2 = halted).
    #[must_use]
    pub const fn severity(&self) -> u8 {
        match self {
            Self::Returned(_) => 0,
            Self::Errored(_) => 1,
            Self::Halted => 2,
        }
    }

    /// Returns true for `Returned`.
    #[must_use]
    pub const fn is_returned(&self) -> bool {
        matches!(self, Self::Returned(_))
    }

    /// Returns true for `Errored`.
    #[must_use]
    pub const fn is_errored(&self) -> bool {
        matches!(self, Self::Errored(_))
    }

    /// Returns true for `Halted`.
    #[must_use]
    pub const fn is_halted(&self) -> bool {
        matches!(self, Self::Halted)
    }

    /// Maps the returned value.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Self::Returned(v) => Outcome::Returned(f(v)),
            Self::Errored(e) => Outcome::Errored(e),
            Self::Halted => Outcome::Halted,
        }
    }

    /// Returns the value, discarding failure detail.
    #[must_use]
    pub fn returned(self) -> Option<T> {
        match self {
            Self::Returned(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the error, if this outcome is `Errored`.
    #[must_use]
    pub fn errored(self) -> Option<Error> {
        match self {
            Self::Errored(e) => Some(e),
            _ => None,
        }
    }

    /// Converts into a `Result`, mapping `Halted` to a halt-kind error.
    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Self::Returned(v) => Ok(v),
            Self::Errored(e) => Err(e),
            Self::Halted => Err(Error::new(ErrorKind::Halted)),
        }
    }

    /// Returns the value or panics.
    ///
    /// # Panics
    ///
    /// Panics unless the outcome is `Returned`.
    #[track_caller]
    pub fn unwrap(self) -> T {
        match self {
            Self::Returned(v) => v,
            Self::Errored(e) => panic!("called `Outcome::unwrap()` on an `Errored` value: {e}"),
            Self::Halted => panic!("called `Outcome::unwrap()` on a `Halted` value"),
        }
    }
}

impl<T> From<Result<T, Error>> for Outcome<T> {
    fn from(result: Result<T, Error>) -> Self {
        match result {
            Ok(v) => Self::Returned(v),
            Err(e) => Self::Errored(e),
        }
    }
}

impl<T: fmt::Debug> fmt::Display for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Returned(v) => write!(f, "returned({v:?})"),
            Self::Errored(e) => write!(f, "errored({e})"),
            Self::Halted => write!(f, "halted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        let returned: Outcome<i32> = Outcome::Returned(1);
        let errored: Outcome<i32> = Outcome::Errored(Error::msg("boom"));
        let halted: Outcome<i32> = Outcome::Halted;
        assert!(returned.severity() < errored.severity());
        assert!(errored.severity() < halted.severity());
    }

    #[test]
    fn predicates() {
        assert!(Outcome::Returned(()).is_returned());
        assert!(Outcome::<()>::Errored(Error::msg("x")).is_errored());
        assert!(Outcome::<()>::Halted.is_halted());
    }

    #[test]
    fn map_touches_only_returned() {
        assert_eq!(Outcome::Returned(21).map(|v| v * 2).returned(), Some(42));
        assert!(Outcome::<i32>::Halted.map(|v| v * 2).is_halted());
    }

    #[test]
    fn into_result_maps_halt_to_halt_kind() {
        let err = Outcome::<()>::Halted.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Halted);
    }

    #[test]
    fn from_result_round_trip() {
        let ok: Outcome<i32> = Ok(5).into();
        assert_eq!(ok.returned(), Some(5));
        let err: Outcome<i32> = Err(Error::msg("nope")).into();
        assert!(err.is_errored());
    }
}
