//! Convergence checks over many interleavings.
//!
//! [`check_convergence`] samples interleavings with one seed each;
//! [`explore`] walks them systematically, depth first, forking the model at
//! every step where more than one queue could win.

use serde::Serialize;

use crate::error::{ReplayError, Result};
use crate::population::Population;
use crate::replay::{ReplayModel, ReplayOptions, ReplayOutcome, hash_hex};

// ============================================================================
// Seeded sampling
// ============================================================================

/// Summary of runs that all reached the same replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Convergence {
    /// Hex state hash every run ended in.
    pub state_hash: String,
    pub runs: usize,
    /// Fewest and most entries applied by a single run.
    pub min_applied: usize,
    pub max_applied: usize,
}

/// Runs the population once per seed and checks every run drains to the
/// same replica.
pub fn check_convergence(
    population: &Population,
    options: ReplayOptions,
    seeds: impl IntoIterator<Item = u64>,
) -> Result<Convergence> {
    let mut summary: Option<Convergence> = None;
    for seed in seeds {
        let outcome = ReplayModel::from_population(population, options).run(seed)?;
        let actual = hash_hex(&outcome.state_hash());
        tracing::debug!(seed, applied = outcome.applied(), state_hash = %actual, "seed drained");
        summary = Some(match summary {
            None => first_run(actual, &outcome),
            Some(summary) if summary.state_hash != actual => {
                return Err(ReplayError::Divergence {
                    seed,
                    expected: summary.state_hash,
                    actual,
                });
            }
            Some(summary) => summary.merge(&outcome),
        });
    }
    Ok(summary.unwrap_or_else(|| {
        let origin = ReplayModel::from_population(population, options);
        Convergence {
            state_hash: hash_hex(&origin.replica().state_hash()),
            runs: 0,
            min_applied: 0,
            max_applied: 0,
        }
    }))
}

fn first_run(state_hash: String, outcome: &ReplayOutcome) -> Convergence {
    Convergence {
        state_hash,
        runs: 1,
        min_applied: outcome.applied(),
        max_applied: outcome.applied(),
    }
}

impl Convergence {
    fn merge(mut self, outcome: &ReplayOutcome) -> Self {
        self.runs += 1;
        self.min_applied = self.min_applied.min(outcome.applied());
        self.max_applied = self.max_applied.max(outcome.applied());
        self
    }
}

// ============================================================================
// Exhaustive walk
// ============================================================================

/// Result of a depth-first walk over interleavings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exploration {
    /// Complete interleavings walked.
    pub paths: usize,
    /// Whether every interleaving was walked, rather than stopping at the
    /// budget.
    pub exhaustive: bool,
    /// Hex state hash every walked interleaving ended in.
    pub state_hash: Option<String>,
}

/// Walks up to `budget` complete interleavings depth first and checks they
/// all end in the same replica.
///
/// At each step the first selectable queue is followed and every other one
/// is forked onto a stack, as long as the stack and the walked paths fit in
/// the budget. Forks beyond that are dropped and the walk is reported as not
/// exhaustive.
pub fn explore(
    population: &Population,
    options: ReplayOptions,
    budget: usize,
) -> Result<Exploration> {
    let mut stack = vec![ReplayModel::from_population(population, options)];
    let mut paths = 0;
    let mut pruned = false;
    let mut expected: Option<String> = None;

    while paths < budget {
        let Some(mut model) = stack.pop() else {
            break;
        };
        loop {
            let selectable = model.selectable();
            let Some((first, rest)) = selectable.split_first() else {
                break;
            };
            for key in rest.iter().rev() {
                if paths + stack.len() + 1 >= budget {
                    pruned = true;
                    break;
                }
                let mut fork = model.clone();
                fork.step(key)?;
                stack.push(fork);
            }
            model.step(first)?;
        }

        let outcome = model.finish()?;
        let actual = hash_hex(&outcome.state_hash());
        match &expected {
            Some(expected) if *expected != actual => {
                return Err(ReplayError::PathDivergence {
                    path: paths,
                    expected: expected.clone(),
                    actual,
                });
            }
            Some(_) => {}
            None => expected = Some(actual),
        }
        paths += 1;
    }

    let exhaustive = !pruned && stack.is_empty();
    tracing::debug!(paths, exhaustive, "exploration finished");
    Ok(Exploration {
        paths,
        exhaustive,
        state_hash: expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_seed_range_reports_no_runs() {
        let convergence =
            check_convergence(&Population::grid(1, 1), ReplayOptions::default(), 0..0).unwrap();
        assert_eq!(convergence.runs, 0);
        assert_eq!(convergence.max_applied, 0);
    }

    #[test]
    fn single_group_has_one_interleaving() {
        let exploration = explore(&Population::grid(1, 0), ReplayOptions::default(), 8).unwrap();
        assert_eq!(exploration.paths, 1);
        assert!(exploration.exhaustive);
    }

    #[test]
    fn budget_bounds_the_walk() {
        let exploration = explore(&Population::grid(2, 1), ReplayOptions::default(), 3).unwrap();
        assert_eq!(exploration.paths, 3);
        assert!(!exploration.exhaustive);
    }
}
