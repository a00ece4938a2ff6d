//! Island-partitioned program database.
//!
//! Each island sits behind its own mutex. Single-island operations lock one
//! island; `migrate` takes every island lock in ascending index order. The
//! generation counter is atomic and advanced while the destination island
//! is locked, so per-island insertion order matches generation order.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::core::errors::{DatabaseError, EmptyPopulation};
use crate::core::island::{EvictionTieBreak, InsertOutcome, Island};
use crate::core::sampling::SamplingPolicy;
use crate::core::types::{Candidate, EvalStatus, Evaluation, Proposal, fingerprint};

/// How `get_parents` picks the island to sample from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IslandSelection {
    #[default]
    Random,
    RoundRobin,
}

/// Population settings (`[database]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub islands: usize,
    pub island_capacity: usize,
    /// Iterations between migrations; 0 disables migration.
    pub migration_interval: u32,
    /// Share of islands reset per migration (rounded down).
    pub reset_fraction: f64,
    pub island_selection: IslandSelection,
    pub eviction_tie_break: EvictionTieBreak,
    /// Refuse a candidate whose exact source is already on its island.
    pub deduplicate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            islands: 4,
            island_capacity: 50,
            migration_interval: 25,
            reset_fraction: 0.5,
            island_selection: IslandSelection::Random,
            eviction_tie_break: EvictionTieBreak::OldestFirst,
            deduplicate: true,
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.islands == 0 {
            return Err(anyhow!("database.islands must be > 0"));
        }
        if self.island_capacity == 0 {
            return Err(anyhow!("database.island_capacity must be > 0"));
        }
        if !(0.0..1.0).contains(&self.reset_fraction) {
            return Err(anyhow!("database.reset_fraction must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Parents drawn from one island.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentSet {
    pub island_id: usize,
    pub parents: Vec<Candidate>,
}

impl ParentSet {
    pub fn generations(&self) -> Vec<u64> {
        self.parents.iter().map(Candidate::generation).collect()
    }
}

/// Result of [`ProgramDatabase::register`].
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// Evaluation was not valid; nothing stored.
    Rejected(EvalStatus),
    Stored {
        generation: u64,
        evicted: Option<Candidate>,
    },
    /// Valid but ranked below every member of a full island.
    Discarded { generation: u64 },
    /// Same source already present on the island.
    Duplicate,
}

impl Registration {
    pub fn is_stored(&self) -> bool {
        matches!(self, Registration::Stored { .. })
    }
}

/// What a migration did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Island whose champion seeded the resets.
    pub donor: Option<usize>,
    /// Islands that were reset, ascending.
    pub reset: Vec<usize>,
    /// Resets that fell back to a copy of the champion.
    pub champion_copies: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IslandStats {
    pub island_id: usize,
    pub size: usize,
    pub best_fitness: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseStats {
    pub size: usize,
    pub generation: u64,
    pub rejected: u64,
    pub best_fitness: Option<f64>,
    pub avg_fitness: Option<f64>,
    pub worst_fitness: Option<f64>,
    pub islands: Vec<IslandStats>,
}

#[derive(Debug)]
pub struct ProgramDatabase {
    islands: Vec<Mutex<Island>>,
    config: DatabaseConfig,
    sampling: SamplingPolicy,
    generation: AtomicU64,
    rejected: AtomicU64,
    cursor: AtomicUsize,
}

impl ProgramDatabase {
    pub fn new(config: DatabaseConfig, sampling: SamplingPolicy) -> Self {
        let islands = (0..config.islands.max(1))
            .map(|id| {
                Mutex::new(Island::new(
                    id,
                    config.island_capacity,
                    config.eviction_tie_break,
                    config.deduplicate,
                ))
            })
            .collect();
        Self {
            islands,
            config,
            sampling,
            generation: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn island_count(&self) -> usize {
        self.islands.len()
    }

    /// Next generation number to be handed out.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    /// Store a valid evaluation on `island_id`; count and drop anything else.
    pub fn register(
        &self,
        proposal: &Proposal,
        evaluation: &Evaluation,
        island_id: usize,
    ) -> Result<Registration, DatabaseError> {
        if !evaluation.is_valid() {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            let status = match evaluation.status {
                EvalStatus::Valid => EvalStatus::RuntimeFailure,
                other => other,
            };
            debug!(island_id, %status, "registration rejected");
            return Ok(Registration::Rejected(status));
        }

        let mut island = self.lock(island_id)?;
        if island.contains_source(&fingerprint(&proposal.source)) {
            return Ok(Registration::Duplicate);
        }
        let generation = self.next_generation();
        let candidate = Candidate::new(
            Arc::from(proposal.source.as_str()),
            evaluation,
            generation,
            island_id,
            proposal.parent_generations.clone(),
        );
        let registration = match island.insert(candidate) {
            InsertOutcome::Stored { evicted } => Registration::Stored {
                generation,
                evicted,
            },
            InsertOutcome::Discarded => Registration::Discarded { generation },
            InsertOutcome::Duplicate => Registration::Duplicate,
        };
        debug!(
            island_id,
            generation,
            fitness = evaluation.fitness,
            stored = registration.is_stored(),
            "registered candidate"
        );
        Ok(registration)
    }

    /// Reset every island to a copy of the seed program.
    #[instrument(skip_all, fields(islands = self.islands.len()))]
    pub fn seed_all(&self, proposal: &Proposal, evaluation: &Evaluation) -> Result<(), DatabaseError> {
        if !evaluation.is_valid() {
            return Err(DatabaseError::InvalidSeed(evaluation.status));
        }
        let source: Arc<str> = Arc::from(proposal.source.as_str());
        for island_id in 0..self.islands.len() {
            let mut island = self.lock(island_id)?;
            let generation = self.next_generation();
            island.reset(Candidate::new(
                Arc::clone(&source),
                evaluation,
                generation,
                island_id,
                proposal.parent_generations.clone(),
            ));
        }
        info!(fitness = evaluation.fitness, "seeded islands");
        Ok(())
    }

    /// Fail with the first empty island, if any.
    pub fn ensure_seeded(&self) -> Result<(), DatabaseError> {
        for island_id in 0..self.islands.len() {
            if self.lock(island_id)?.is_empty() {
                return Err(EmptyPopulation { island_id }.into());
            }
        }
        Ok(())
    }

    /// Pick an island and draw up to `count` parents from it.
    pub fn get_parents<R: Rng + ?Sized>(
        &self,
        count: usize,
        rng: &mut R,
    ) -> Result<ParentSet, DatabaseError> {
        let island_id = match self.config.island_selection {
            IslandSelection::Random => rng.gen_range(0..self.islands.len()),
            IslandSelection::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::SeqCst) % self.islands.len()
            }
        };
        let parents = self
            .lock(island_id)?
            .sample_parents(count, &self.sampling, rng)?;
        Ok(ParentSet { island_id, parents })
    }

    /// Highest fitness across islands; ties go to the lowest generation.
    pub fn best_overall(&self) -> Result<Option<Candidate>, DatabaseError> {
        let mut best: Option<Candidate> = None;
        for island_id in 0..self.islands.len() {
            let island = self.lock(island_id)?;
            let Some(candidate) = island.best() else {
                continue;
            };
            if best.as_ref().is_none_or(|current| candidate.outranks(current)) {
                best = Some(candidate.clone());
            }
        }
        Ok(best)
    }

    /// Members of one island, best-first.
    pub fn island_members(&self, island_id: usize) -> Result<Vec<Candidate>, DatabaseError> {
        Ok(self.lock(island_id)?.members().cloned().collect())
    }

    pub fn stats(&self) -> Result<DatabaseStats, DatabaseError> {
        let mut islands = Vec::with_capacity(self.islands.len());
        let mut size = 0usize;
        let mut total = 0.0;
        let mut best: Option<f64> = None;
        let mut worst: Option<f64> = None;
        for island_id in 0..self.islands.len() {
            let island = self.lock(island_id)?;
            for member in island.members() {
                size += 1;
                total += member.fitness();
            }
            let island_best = island.best().map(Candidate::fitness);
            let island_worst = island.worst().map(Candidate::fitness);
            best = max_option(best, island_best);
            worst = match (worst, island_worst) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            islands.push(IslandStats {
                island_id,
                size: island.len(),
                best_fitness: island_best,
            });
        }
        Ok(DatabaseStats {
            size,
            generation: self.generation(),
            rejected: self.rejected(),
            best_fitness: best,
            avg_fitness: (size > 0).then(|| total / size as f64),
            worst_fitness: worst,
            islands,
        })
    }

    /// Reset the weakest islands from the global champion.
    ///
    /// `reseed(champion, island_id)` is called once per target island with no
    /// locks held and may return a replacement seed; `None` or a non-valid
    /// evaluation falls back to a copy of the champion. The island holding the
    /// global best is never reset.
    #[instrument(skip_all, fields(islands = self.islands.len()))]
    pub fn migrate<F>(&self, mut reseed: F) -> Result<MigrationReport>
    where
        F: FnMut(&Candidate, usize) -> Result<Option<(Proposal, Evaluation)>>,
    {
        let reset_count = ((self.islands.len() as f64) * self.config.reset_fraction).floor()
            as usize;
        let reset_count = reset_count.min(self.islands.len().saturating_sub(1));
        if reset_count == 0 {
            return Ok(MigrationReport::default());
        }

        let snapshot: Vec<Option<Candidate>> = (0..self.islands.len())
            .map(|island_id| Ok(self.lock(island_id)?.best().cloned()))
            .collect::<Result<_, DatabaseError>>()?;
        let Some(donor) = strongest(&snapshot) else {
            return Ok(MigrationReport::default());
        };
        let champion = snapshot[donor]
            .clone()
            .ok_or_else(|| anyhow!("donor island {donor} has no champion"))?;

        let mut weakest: Vec<usize> = (0..snapshot.len()).filter(|&id| id != donor).collect();
        weakest.sort_by(|&a, &b| {
            let fa = snapshot[a].as_ref().map_or(f64::NEG_INFINITY, Candidate::fitness);
            let fb = snapshot[b].as_ref().map_or(f64::NEG_INFINITY, Candidate::fitness);
            fa.total_cmp(&fb).then_with(|| b.cmp(&a))
        });
        weakest.truncate(reset_count);
        weakest.sort_unstable();

        let mut seeds = Vec::with_capacity(weakest.len());
        for &island_id in &weakest {
            let seed = reseed(&champion, island_id)?.filter(|(_, evaluation)| evaluation.is_valid());
            seeds.push(seed);
        }

        // Ascending lock order across all islands.
        let mut guards: Vec<MutexGuard<'_, Island>> = (0..self.islands.len())
            .map(|island_id| self.lock(island_id))
            .collect::<Result<_, DatabaseError>>()?;
        let current: Vec<Option<Candidate>> =
            guards.iter().map(|island| island.best().cloned()).collect();
        let holder = strongest(&current);

        let mut report = MigrationReport {
            donor: Some(donor),
            ..MigrationReport::default()
        };
        for (island_id, seed) in weakest.into_iter().zip(seeds) {
            if Some(island_id) == holder {
                continue;
            }
            let generation = self.next_generation();
            let candidate = match seed {
                Some((proposal, evaluation)) => Candidate::new(
                    Arc::from(proposal.source.as_str()),
                    &evaluation,
                    generation,
                    island_id,
                    proposal.parent_generations,
                ),
                None => {
                    report.champion_copies += 1;
                    champion.transplant(generation, island_id)
                }
            };
            guards[island_id].reset(candidate);
            report.reset.push(island_id);
        }

        info!(
            donor,
            reset = ?report.reset,
            champion_fitness = champion.fitness(),
            "migration complete"
        );
        Ok(report)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst)
    }

    fn lock(&self, island_id: usize) -> Result<MutexGuard<'_, Island>, DatabaseError> {
        let island = self
            .islands
            .get(island_id)
            .ok_or(DatabaseError::UnknownIsland {
                island_id,
                islands: self.islands.len(),
            })?;
        island.lock().map_err(|_| DatabaseError::Poisoned(island_id))
    }
}

/// Index of the best champion, using the same tie rule as `best_overall`.
fn strongest(champions: &[Option<Candidate>]) -> Option<usize> {
    let mut best: Option<(usize, &Candidate)> = None;
    for (island_id, champion) in champions.iter().enumerate() {
        let Some(champion) = champion else {
            continue;
        };
        if best.is_none_or(|(_, current)| champion.outranks(current)) {
            best = Some((island_id, champion));
        }
    }
    best.map(|(island_id, _)| island_id)
}

fn max_option(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
