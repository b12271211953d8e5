//! Risk-level buckets of prefetched slang entries.
//! Three bounded FIFO queues, one per risk level. `RiskStacks` is the plain
//! data structure; `manager::RiskStackManager` drives fetching around it.

pub mod manager;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::slang::{RiskLevel, SlangEntry};

pub use manager::{FillOutcome, FillReport, RiskStackManager, StackError, StackEvent};

/// Which bucket(s) the user wants to draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskFilter {
    #[default]
    All,
    Safe,
    Careful,
    Avoid,
}

impl RiskFilter {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Some(RiskFilter::All),
            "safe" => Some(RiskFilter::Safe),
            "careful" => Some(RiskFilter::Careful),
            "avoid" => Some(RiskFilter::Avoid),
            _ => None,
        }
    }

    /// The single level this filter names, or None for `All`.
    pub fn level(self) -> Option<RiskLevel> {
        match self {
            RiskFilter::All => None,
            RiskFilter::Safe => Some(RiskLevel::Safe),
            RiskFilter::Careful => Some(RiskLevel::Careful),
            RiskFilter::Avoid => Some(RiskLevel::Avoid),
        }
    }
}

/// Tunables for prefetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    /// Max entries per bucket.
    pub capacity: usize,
    /// Concurrent fetches issued by `initialize`.
    pub initial_batch: usize,
    /// Extra fetches per fill, since risk levels are unknown until enriched.
    pub overshoot: usize,
    /// Upper bound on fetches per fill.
    pub max_fill_batch: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            initial_batch: 15,
            overshoot: 3,
            max_fill_batch: 10,
        }
    }
}

impl StackConfig {
    /// Fetch attempts a fill issues for the given shortfall.
    pub fn fill_attempts(&self, needed: usize) -> usize {
        (needed + self.overshoot).min(self.max_fill_batch)
    }
}

/// Per-level sizes, the projection handed to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StockCounts {
    pub safe: usize,
    pub careful: usize,
    pub avoid: usize,
}

impl StockCounts {
    pub fn get(&self, level: RiskLevel) -> usize {
        match level {
            RiskLevel::Safe => self.safe,
            RiskLevel::Careful => self.careful,
            RiskLevel::Avoid => self.avoid,
        }
    }

    pub fn total(&self) -> usize {
        self.safe + self.careful + self.avoid
    }
}

/// Three independent bounded FIFO queues.
#[derive(Debug)]
pub struct RiskStacks {
    capacity: usize,
    safe: VecDeque<SlangEntry>,
    careful: VecDeque<SlangEntry>,
    avoid: VecDeque<SlangEntry>,
}

impl RiskStacks {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            safe: VecDeque::with_capacity(capacity),
            careful: VecDeque::with_capacity(capacity),
            avoid: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn bucket(&self, level: RiskLevel) -> &VecDeque<SlangEntry> {
        match level {
            RiskLevel::Safe => &self.safe,
            RiskLevel::Careful => &self.careful,
            RiskLevel::Avoid => &self.avoid,
        }
    }

    fn bucket_mut(&mut self, level: RiskLevel) -> &mut VecDeque<SlangEntry> {
        match level {
            RiskLevel::Safe => &mut self.safe,
            RiskLevel::Careful => &mut self.careful,
            RiskLevel::Avoid => &mut self.avoid,
        }
    }

    pub fn len(&self, level: RiskLevel) -> usize {
        self.bucket(level).len()
    }

    pub fn is_full(&self, level: RiskLevel) -> bool {
        self.len(level) >= self.capacity
    }

    pub fn all_full(&self) -> bool {
        RiskLevel::PRIORITY.iter().all(|&l| self.is_full(l))
    }

    /// Σ over levels of the free slots.
    pub fn needed(&self) -> usize {
        RiskLevel::PRIORITY
            .iter()
            .map(|&l| self.capacity.saturating_sub(self.len(l)))
            .sum()
    }

    /// Appends to the entry's bucket, or hands the entry back when that bucket is full.
    pub fn push(&mut self, entry: SlangEntry) -> Result<(), SlangEntry> {
        let capacity = self.capacity;
        let bucket = self.bucket_mut(entry.risk_level);
        if bucket.len() >= capacity {
            return Err(entry);
        }
        bucket.push_back(entry);
        Ok(())
    }

    /// Removes the oldest entry matching the filter. `All` scans safe → careful → avoid.
    pub fn pop(&mut self, filter: RiskFilter) -> Option<SlangEntry> {
        match filter.level() {
            Some(level) => self.bucket_mut(level).pop_front(),
            None => RiskLevel::PRIORITY
                .iter()
                .find_map(|&level| self.bucket_mut(level).pop_front()),
        }
    }

    pub fn clear(&mut self) {
        self.safe.clear();
        self.careful.clear();
        self.avoid.clear();
    }

    pub fn counts(&self) -> StockCounts {
        StockCounts {
            safe: self.safe.len(),
            careful: self.careful.len(),
            avoid: self.avoid.len(),
        }
    }
}
