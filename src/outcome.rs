//! # Outcome
//!
//! `Outcome<V>` is the payload of every asynchronous result. It separates
//! three situations that `Option<V>` would collapse into two:
//!
//! | Variant | Meaning |
//! |---------|---------|
//! | `Absent` | Nothing was found (no row, empty plan, rolled back) |
//! | `Null` | Something was found, but its value is SQL `NULL` |
//! | `Value(v)` | Something was found and it has a value |

/// A tri-state optional.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Outcome<V> {
    /// No value was produced.
    #[default]
    Absent,
    /// A value is present but null.
    Null,
    /// A value is present.
    Value(V),
}

impl<V> Outcome<V> {
    /// Returns true unless this is `Absent`.
    pub fn is_present(&self) -> bool {
        !matches!(self, Outcome::Absent)
    }

    /// Returns true for `Absent`.
    pub fn is_absent(&self) -> bool {
        matches!(self, Outcome::Absent)
    }

    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Outcome::Null)
    }

    /// Borrows the value, if any.
    pub fn value(&self) -> Option<&V> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Converts into the value, dropping the absent/null distinction.
    pub fn into_value(self) -> Option<V> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Borrows the contents as an `Outcome<&V>`.
    pub fn as_ref(&self) -> Outcome<&V> {
        match self {
            Outcome::Absent => Outcome::Absent,
            Outcome::Null => Outcome::Null,
            Outcome::Value(v) => Outcome::Value(v),
        }
    }

    /// Maps the value, keeping `Absent` and `Null` as they are.
    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Outcome<U> {
        match self {
            Outcome::Absent => Outcome::Absent,
            Outcome::Null => Outcome::Null,
            Outcome::Value(v) => Outcome::Value(f(v)),
        }
    }

    /// Chains a computation that may itself be absent or null.
    pub fn and_then<U>(self, f: impl FnOnce(V) -> Outcome<U>) -> Outcome<U> {
        match self {
            Outcome::Absent => Outcome::Absent,
            Outcome::Null => Outcome::Null,
            Outcome::Value(v) => f(v),
        }
    }
}

/// `None` maps to `Null`: the caller produced a slot, but it was empty.
impl<V> From<Option<V>> for Outcome<V> {
    fn from(value: Option<V>) -> Self {
        match value {
            Some(v) => Outcome::Value(v),
            None => Outcome::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_and_null_are_distinct() {
        let absent: Outcome<i64> = Outcome::Absent;
        let null: Outcome<i64> = Outcome::Null;

        assert!(!absent.is_present());
        assert!(null.is_present());
        assert_ne!(absent, null);
        assert_eq!(absent.value(), null.value());
    }

    #[test]
    fn test_map_preserves_state() {
        assert_eq!(Outcome::Value(2).map(|v| v * 10), Outcome::Value(20));
        assert_eq!(Outcome::<i32>::Null.map(|v| v * 10), Outcome::Null);
        assert_eq!(Outcome::<i32>::Absent.map(|v| v * 10), Outcome::Absent);
    }

    #[test]
    fn test_from_option() {
        assert_eq!(Outcome::from(Some("x")), Outcome::Value("x"));
        assert_eq!(Outcome::<&str>::from(None), Outcome::Null);
        assert_eq!(Outcome::<u8>::default(), Outcome::Absent);
    }
}
