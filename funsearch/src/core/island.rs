//! One bounded, fitness-ordered sub-population.
//!
//! Candidates live in a slot arena and are ordered through a `BTreeSet` of
//! rank keys, which gives O(log n) insert and eviction. The best slot is
//! cached after every mutation.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::errors::EmptyPopulation;
use crate::core::sampling::{SamplingPolicy, draw_without_replacement};
use crate::core::types::Candidate;

/// Which member goes first when several share the minimum fitness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionTieBreak {
    /// Evict the lowest generation, keeping recent discoveries.
    #[default]
    OldestFirst,
    /// Evict the highest generation, keeping incumbents.
    NewestFirst,
}

/// Ordering key: fitness ascending, then generation descending, then slot
/// descending. The greatest key is the best member (ties → earliest).
#[derive(Debug, Clone, Copy)]
struct RankKey {
    fitness: f64,
    generation: u64,
    slot: usize,
}

impl RankKey {
    fn of(candidate: &Candidate, slot: usize) -> Self {
        Self {
            fitness: candidate.fitness(),
            generation: candidate.generation(),
            slot,
        }
    }
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fitness
            .total_cmp(&other.fitness)
            .then_with(|| other.generation.cmp(&self.generation))
            .then_with(|| other.slot.cmp(&self.slot))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RankKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankKey {}

/// Result of [`Island::insert`].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// Stored; `evicted` holds the member pushed out by the overflow, if any.
    Stored { evicted: Option<Candidate> },
    /// The island was full and the newcomer ranked lowest.
    Discarded,
    /// An identical source is already present.
    Duplicate,
}

#[derive(Debug)]
pub struct Island {
    id: usize,
    capacity: usize,
    tie_break: EvictionTieBreak,
    deduplicate: bool,
    slots: Vec<Option<Candidate>>,
    free: Vec<usize>,
    ranking: BTreeSet<RankKey>,
    fingerprints: HashMap<String, usize>,
    best: Option<usize>,
}

impl Island {
    pub fn new(id: usize, capacity: usize, tie_break: EvictionTieBreak, deduplicate: bool) -> Self {
        Self {
            id,
            capacity: capacity.max(1),
            tie_break,
            deduplicate,
            slots: Vec::new(),
            free: Vec::new(),
            ranking: BTreeSet::new(),
            fingerprints: HashMap::new(),
            best: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ranking.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranking.is_empty()
    }

    pub fn best(&self) -> Option<&Candidate> {
        self.best.and_then(|slot| self.slots[slot].as_ref())
    }

    pub fn worst(&self) -> Option<&Candidate> {
        self.ranking
            .first()
            .and_then(|key| self.slots[key.slot].as_ref())
    }

    pub fn contains_source(&self, fingerprint: &str) -> bool {
        self.fingerprints.contains_key(fingerprint)
    }

    /// Members ordered best-first.
    pub fn members(&self) -> impl Iterator<Item = &Candidate> {
        self.ranking
            .iter()
            .rev()
            .filter_map(|key| self.slots[key.slot].as_ref())
    }

    /// Add `candidate`; when that overflows capacity, evict the lowest-ranked
    /// member, which may be the newcomer itself.
    pub fn insert(&mut self, candidate: Candidate) -> InsertOutcome {
        debug_assert_eq!(candidate.island_id(), self.id);
        if self.deduplicate && self.contains_source(candidate.fingerprint()) {
            return InsertOutcome::Duplicate;
        }

        let slot = self.free.pop().unwrap_or_else(|| {
            self.slots.push(None);
            self.slots.len() - 1
        });
        self.ranking.insert(RankKey::of(&candidate, slot));
        self.fingerprints
            .insert(candidate.fingerprint().to_string(), slot);
        self.slots[slot] = Some(candidate);

        let outcome = if self.ranking.len() > self.capacity {
            match self.eviction_victim().and_then(|victim| self.remove(victim)) {
                Some((victim_slot, _)) if victim_slot == slot => InsertOutcome::Discarded,
                Some((_, evicted)) => InsertOutcome::Stored {
                    evicted: Some(evicted),
                },
                None => InsertOutcome::Stored { evicted: None },
            }
        } else {
            InsertOutcome::Stored { evicted: None }
        };

        self.refresh_best();
        outcome
    }

    /// Draw up to `count` distinct members, weighted toward higher fitness.
    pub fn sample_parents<R: Rng + ?Sized>(
        &self,
        count: usize,
        policy: &SamplingPolicy,
        rng: &mut R,
    ) -> Result<Vec<Candidate>, EmptyPopulation> {
        if self.is_empty() {
            return Err(EmptyPopulation { island_id: self.id });
        }
        let members: Vec<&Candidate> = self.members().collect();
        let fitness: Vec<f64> = members.iter().map(|member| member.fitness()).collect();
        let weights = policy.weights(&fitness);
        Ok(draw_without_replacement(&weights, count, rng)
            .into_iter()
            .map(|index| members[index].clone())
            .collect())
    }

    /// Drop every member and restart from `seed`.
    pub fn reset(&mut self, seed: Candidate) {
        self.slots.clear();
        self.free.clear();
        self.ranking.clear();
        self.fingerprints.clear();
        self.best = None;
        self.insert(seed);
    }

    fn eviction_victim(&self) -> Option<RankKey> {
        let lowest = *self.ranking.first()?;
        match self.tie_break {
            EvictionTieBreak::NewestFirst => Some(lowest),
            EvictionTieBreak::OldestFirst => {
                // Greatest key sharing the minimum fitness is the oldest of the tie.
                let ceiling = RankKey {
                    fitness: lowest.fitness,
                    generation: 0,
                    slot: 0,
                };
                self.ranking.range(..=ceiling).next_back().copied()
            }
        }
    }

    fn remove(&mut self, key: RankKey) -> Option<(usize, Candidate)> {
        if !self.ranking.remove(&key) {
            return None;
        }
        let candidate = self.slots[key.slot].take()?;
        self.fingerprints.remove(candidate.fingerprint());
        self.free.push(key.slot);
        Some((key.slot, candidate))
    }

    fn refresh_best(&mut self) {
        self.best = self.ranking.last().map(|key| key.slot);
    }
}
