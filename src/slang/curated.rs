//! Hand-picked seed terms, drawn without repetition until the list is
//! exhausted, then the cycle starts over.

use std::collections::HashSet;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tracing::debug;

pub const CURATED_TERMS: &[&str] = &[
    "lowkey", "highkey", "no cap", "cap", "slay", "rizz", "sus", "bet", "vibe",
    "simp", "stan", "goat", "flex", "salty", "lit", "fire", "fam", "bae",
    "ghosting", "clout", "tea", "spill the tea", "snatched", "basic", "extra",
    "mood", "big mood", "periodt", "wig", "shook", "woke", "cancel", "receipts",
    "glow up", "finesse", "deadass", "bruh", "yeet", "bussin", "slaps",
    "hits different", "rent free", "main character", "understood the assignment",
    "living rent free", "its giving", "ate", "serve", "gagged",
    "catch these hands", "clap back", "read", "shade", "pressed", "triggered",
    "on god", "fr", "ngl", "iykyk", "ijbol", "delulu", "ate and left no crumbs",
    "say less", "vibin", "cheugy", "mid", "W", "L", "based", "cringe",
    "ratio", "oomf", "mutuals", "pick me", "red flag", "green flag", "beige flag",
    "ick", "roman empire", "girl dinner", "girl math", "demure", "brat summer",
];

/// Cycles through a term list in random order without repeats.
pub struct CuratedTerms {
    terms: Vec<String>,
    used: Mutex<HashSet<usize>>,
}

impl CuratedTerms {
    /// Duplicate terms collapse to one slot. An empty list is allowed;
    /// `next_term` then always returns None.
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let terms = terms
            .into_iter()
            .map(Into::into)
            .filter(|t: &String| seen.insert(t.clone()))
            .collect();
        Self {
            terms,
            used: Mutex::new(HashSet::new()),
        }
    }

    pub fn builtin() -> Self {
        Self::new(CURATED_TERMS.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn next_term(&self) -> Option<String> {
        if self.terms.is_empty() {
            return None;
        }
        let mut used = self.used.lock();
        if used.len() >= self.terms.len() {
            debug!(terms = self.terms.len(), "curated cycle exhausted, resetting");
            used.clear();
        }
        let available: Vec<usize> = (0..self.terms.len()).filter(|i| !used.contains(i)).collect();
        let pick = *available.choose(&mut rand::thread_rng())?;
        used.insert(pick);
        Some(self.terms[pick].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_repeat_within_a_cycle() {
        let curated = CuratedTerms::new(["a", "b", "c", "d"]);
        let mut first: Vec<String> = (0..4).filter_map(|_| curated.next_term()).collect();
        first.sort();
        assert_eq!(first, vec!["a", "b", "c", "d"]);

        let mut second: Vec<String> = (0..4).filter_map(|_| curated.next_term()).collect();
        second.sort();
        assert_eq!(second, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn duplicates_collapse() {
        let curated = CuratedTerms::new(["snatched", "slay", "snatched"]);
        assert_eq!(curated.len(), 2);
        assert_eq!(CuratedTerms::builtin().len(), CURATED_TERMS.len());
    }

    #[test]
    fn empty_list_yields_nothing() {
        let curated = CuratedTerms::new(Vec::<String>::new());
        assert!(curated.next_term().is_none());
    }
}
