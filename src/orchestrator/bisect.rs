//! Binary search for the newest commit that integrates cleanly.
//!
//! The newest commit is probed first, since the common case is that the
//! whole range integrates. After that the search halves the open interval
//! between the best known good and the first known bad index.

use serde::Serialize;

use crate::integration::Verdict;

/// Final state of a search over `len` commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchOutcome {
    /// Highest index that probed clean.
    pub best_good: Option<usize>,
    /// Lowest index that probed dirty.
    pub first_bad: Option<usize>,
    /// Probed indices in probe order.
    pub probes: Vec<(usize, Verdict)>,
}

impl SearchOutcome {
    pub fn last_probed(&self) -> Option<usize> {
        self.probes.last().map(|(index, _)| *index)
    }
}

/// Search indices `0..len`, assuming a clean prefix followed by a dirty
/// suffix. `probe` is called once per tested index.
pub fn bisect<F>(len: usize, mut probe: F) -> SearchOutcome
where
    F: FnMut(usize) -> Verdict,
{
    let mut outcome = SearchOutcome::default();
    // Candidates are `low..end`.
    let mut low = 0;
    let mut end = len;
    let mut next = len.checked_sub(1);

    while let Some(index) = next {
        let verdict = probe(index);
        outcome.probes.push((index, verdict));
        if verdict.is_clean() {
            outcome.best_good = Some(index);
            low = index + 1;
        } else {
            outcome.first_bad = Some(index);
            end = index;
        }
        next = (low < end).then(|| low + (end - 1 - low) / 2);
    }
    outcome
}

/// Upper bound on probes for `len` commits: one for the head, then a binary
/// search over the rest.
pub fn max_probes(len: usize) -> usize {
    match len {
        0 => 0,
        n => 1 + (usize::BITS - (n - 1).leading_zeros()) as usize,
    }
}
