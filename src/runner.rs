//! Runs the scenario matrix and collects what each run produced.
//!
//! Results are gathered into a `BenchContext` value rather than global state:
//! every group of scenarios fills its own context and the runner merges them
//! once the group finishes.

use crate::config::{BenchSettings, MarkerConfig};
use crate::scenario::{run_scenario, ScenarioOutcome, ScenarioSpec};
use crate::stats::{RunStatistics, Summary};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One recorded scenario run, kept in order for history and JSON output.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub label: String,
    pub iteration: u32,
    pub stats: RunStatistics,
    pub error: Option<String>,
}

/// Everything measured in one invocation, keyed by scenario label.
#[derive(Debug, Default)]
pub struct BenchContext {
    /// Every run's statistics per label, in the order they were recorded.
    pub results: BTreeMap<String, Vec<RunStatistics>>,
    /// The most recent failure per label.
    pub errors: BTreeMap<String, String>,
    pub records: Vec<RunRecord>,
    /// Labels whose fixture had nothing to perturb.
    pub missing_fixtures: Vec<String>,
}

impl BenchContext {
    pub fn record(&mut self, iteration: u32, outcome: ScenarioOutcome) {
        let error = outcome.error.as_ref().map(ToString::to_string);
        if let Some(e) = &outcome.error {
            if e.is_empty_fixture() && !self.missing_fixtures.contains(&outcome.label) {
                self.missing_fixtures.push(outcome.label.clone());
            }
        }
        if let Some(message) = &error {
            self.errors.insert(outcome.label.clone(), message.clone());
        }
        self.results
            .entry(outcome.label.clone())
            .or_default()
            .push(outcome.stats.clone());
        self.records.push(RunRecord {
            label: outcome.label,
            iteration,
            stats: outcome.stats,
            error,
        });
    }

    /// Fold `other` into `self`. Runs append; errors from `other` are newer.
    pub fn merge(&mut self, other: BenchContext) {
        for (label, runs) in other.results {
            self.results.entry(label).or_default().extend(runs);
        }
        self.errors.extend(other.errors);
        self.records.extend(other.records);
        for label in other.missing_fixtures {
            if !self.missing_fixtures.contains(&label) {
                self.missing_fixtures.push(label);
            }
        }
    }

    pub fn summaries(&self) -> BTreeMap<String, Summary> {
        self.results
            .iter()
            .map(|(label, runs)| (label.clone(), Summary::from_runs(runs)))
            .collect()
    }

    pub fn has_missing_fixtures(&self) -> bool {
        !self.missing_fixtures.is_empty()
    }
}

/// Group scenarios whose fixture roots overlap, keeping first-seen order.
///
/// Scenarios on the same root, or on roots nested inside one another, must
/// never overlap in time, or one scenario's perturbations would complete
/// another's waits.
pub fn group_by_root(scenarios: &[ScenarioSpec]) -> Vec<Vec<ScenarioSpec>> {
    let mut groups: Vec<(Vec<PathBuf>, Vec<ScenarioSpec>)> = Vec::new();
    for scenario in scenarios {
        let root = scenario.root();
        let overlapping: Vec<usize> = groups
            .iter()
            .enumerate()
            .filter(|(_, (roots, _))| roots.iter().any(|r| roots_overlap(r, root)))
            .map(|(i, _)| i)
            .collect();

        match overlapping.split_first() {
            None => groups.push((vec![root.clone()], vec![scenario.clone()])),
            Some((&first, rest)) => {
                // A root can bridge two groups that were disjoint so far.
                for &i in rest.iter().rev() {
                    let (roots, members) = groups.remove(i);
                    groups[first].0.extend(roots);
                    groups[first].1.extend(members);
                }
                let (roots, members) = &mut groups[first];
                if !roots.contains(root) {
                    roots.push(root.clone());
                }
                members.push(scenario.clone());
            }
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}

/// True when one root is the other or contains it.
fn roots_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Run every scenario `settings.iterations` times.
///
/// Within an iteration, groups with distinct fixture roots run concurrently
/// when `parallel` is set; scenarios inside a group always run one after
/// another. Iterations run in sequence.
pub async fn run_benchmarks(
    scenarios: &[ScenarioSpec],
    settings: &BenchSettings,
    markers: &MarkerConfig,
    parallel: bool,
) -> BenchContext {
    let groups = group_by_root(scenarios);
    let mut context = BenchContext::default();

    for iteration in 0..settings.iterations {
        tracing::info!(
            iteration = iteration + 1,
            iterations = settings.iterations,
            scenarios = scenarios.len(),
            groups = groups.len(),
            parallel,
            "starting iteration"
        );

        if parallel {
            let runs = groups
                .iter()
                .map(|group| run_group(group, settings, markers, iteration));
            for group_context in join_all(runs).await {
                context.merge(group_context);
            }
        } else {
            for group in &groups {
                let group_context = run_group(group, settings, markers, iteration).await;
                context.merge(group_context);
            }
        }
    }

    context
}

async fn run_group(
    group: &[ScenarioSpec],
    settings: &BenchSettings,
    markers: &MarkerConfig,
    iteration: u32,
) -> BenchContext {
    let mut rng = StdRng::from_entropy();
    let mut context = BenchContext::default();
    for scenario in group {
        let outcome = run_scenario(scenario, settings, markers, &mut rng).await;
        context.record(iteration, outcome);
    }
    context
}
