//! MVCC visibility snapshots.
//!
//! A snapshot answers, for any mutation timestamp, whether the writing
//! transaction is committed and visible to the reader. Snapshots are
//! immutable values and can be shared freely between threads.

use crate::hybrid_time::HybridTime;
use std::fmt;

/// Outcome of checking a timestamp against a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Committed before the snapshot was taken.
    Visible,
    /// Not committed as far as this snapshot knows.
    TooNew,
    /// The writing transaction aborted.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvccSnapshot {
    /// Every timestamp strictly below this is committed.
    all_committed_before: HybridTime,
    /// No timestamp at or above this is committed.
    none_committed_at_or_after: HybridTime,
    /// Committed timestamps in `[all_committed_before, none_committed_at_or_after)`.
    committed: Vec<HybridTime>,
    aborted: Vec<HybridTime>,
}

impl MvccSnapshot {
    /// A snapshot that treats every transaction as committed.
    pub fn including_all_transactions() -> Self {
        Self {
            all_committed_before: HybridTime::MAX,
            none_committed_at_or_after: HybridTime::MAX,
            committed: Vec::new(),
            aborted: Vec::new(),
        }
    }

    /// A snapshot that sees nothing.
    pub fn including_no_transactions() -> Self {
        Self {
            all_committed_before: HybridTime::MIN,
            none_committed_at_or_after: HybridTime::MIN,
            committed: Vec::new(),
            aborted: Vec::new(),
        }
    }

    /// A snapshot that sees exactly the timestamps strictly below `ts`.
    pub fn committed_before(ts: HybridTime) -> Self {
        Self {
            all_committed_before: ts,
            none_committed_at_or_after: ts,
            committed: Vec::new(),
            aborted: Vec::new(),
        }
    }

    /// A snapshot that sees everything below `all_committed_before` plus the
    /// listed timestamps above it.
    pub fn new(
        all_committed_before: HybridTime,
        committed: impl IntoIterator<Item = HybridTime>,
    ) -> Self {
        let mut committed: Vec<HybridTime> = committed
            .into_iter()
            .filter(|ts| *ts >= all_committed_before)
            .collect();
        committed.sort_unstable();
        committed.dedup();
        let none_committed_at_or_after = committed
            .last()
            .map(|ts| ts.incremented())
            .unwrap_or(all_committed_before);
        Self {
            all_committed_before,
            none_committed_at_or_after,
            committed,
            aborted: Vec::new(),
        }
    }

    /// Marks the given timestamps as belonging to aborted transactions.
    pub fn with_aborted(mut self, aborted: impl IntoIterator<Item = HybridTime>) -> Self {
        self.aborted.extend(aborted);
        self.aborted.sort_unstable();
        self.aborted.dedup();
        self
    }

    pub fn visibility(&self, ts: HybridTime) -> Visibility {
        if self.aborted.binary_search(&ts).is_ok() {
            return Visibility::Aborted;
        }
        if ts < self.all_committed_before || self.committed.binary_search(&ts).is_ok() {
            Visibility::Visible
        } else {
            Visibility::TooNew
        }
    }

    pub fn is_committed(&self, ts: HybridTime) -> bool {
        self.visibility(ts) == Visibility::Visible
    }

    /// False only if no transaction at or after `ts` can be visible.
    pub fn may_have_committed_at_or_after(&self, ts: HybridTime) -> bool {
        ts < self.none_committed_at_or_after
    }

    pub fn all_committed_before(&self) -> HybridTime {
        self.all_committed_before
    }
}

impl fmt::Display for MvccSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MvccSnapshot[committed={{T|T < {}",
            self.all_committed_before.value()
        )?;
        if !self.committed.is_empty() {
            write!(f, " or (T in {{")?;
            for (i, ts) in self.committed.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", ts.value())?;
            }
            write!(f, "}})")?;
        }
        write!(f, "}}]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ht(v: u64) -> HybridTime {
        HybridTime::new(v)
    }

    #[test]
    fn test_all_and_none() {
        let all = MvccSnapshot::including_all_transactions();
        let none = MvccSnapshot::including_no_transactions();
        for v in [0, 1, 1_000, u64::MAX - 1] {
            assert!(all.is_committed(ht(v)));
            assert!(!none.is_committed(ht(v)));
        }
        assert!(!none.may_have_committed_at_or_after(ht(0)));
        assert!(all.may_have_committed_at_or_after(ht(1_000)));
    }

    #[test]
    fn test_committed_before() {
        let snap = MvccSnapshot::committed_before(ht(10));
        assert!(snap.is_committed(ht(9)));
        assert_eq!(snap.visibility(ht(10)), Visibility::TooNew);
        assert!(snap.may_have_committed_at_or_after(ht(9)));
        assert!(!snap.may_have_committed_at_or_after(ht(10)));
    }

    #[test]
    fn test_explicit_committed_set() {
        let snap = MvccSnapshot::new(ht(10), [ht(15), ht(12), ht(5)]);
        assert!(snap.is_committed(ht(5)));
        assert!(snap.is_committed(ht(12)));
        assert!(!snap.is_committed(ht(13)));
        assert!(snap.is_committed(ht(15)));
        assert!(snap.may_have_committed_at_or_after(ht(15)));
        assert!(!snap.may_have_committed_at_or_after(ht(16)));
    }

    #[test]
    fn test_aborted_wins() {
        let snap = MvccSnapshot::including_all_transactions().with_aborted([ht(3)]);
        assert_eq!(snap.visibility(ht(3)), Visibility::Aborted);
        assert!(!snap.is_committed(ht(3)));
        assert!(snap.is_committed(ht(4)));
    }

    #[test]
    fn test_display() {
        let snap = MvccSnapshot::new(ht(10), [ht(12), ht(11)]);
        assert_eq!(snap.to_string(), "MvccSnapshot[committed={T|T < 10 or (T in {11,12})}]");
    }
}
