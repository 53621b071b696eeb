//! Bandit policies for operator selection
//!
//! Two policies behind one interface: epsilon-greedy with forced cold-arm
//! exploration, and UCB1 with a shuffled stratified first pass plus warm
//! start. `mean_payoff` is the authoritative signal; `avg_reward` is kept in
//! step for UI continuity.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Running per-operator statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorStats {
    pub pulls: u64,
    pub avg_reward: f64,
    pub mean_payoff: f64,
}

pub type StatsMap = HashMap<String, OperatorStats>;

/// Online running-mean update shared by both policies.
pub fn update_stats(stats: &mut StatsMap, name: &str, reward: f64) {
    let entry = stats.entry(name.to_string()).or_default();
    let n = entry.pulls as f64;
    entry.avg_reward = (entry.avg_reward * n + reward) / (n + 1.0);
    entry.mean_payoff = (entry.mean_payoff * n + reward) / (n + 1.0);
    entry.pulls += 1;
}

/// Operator-selection policy. `select` may keep internal state (the UCB
/// stratified pass does); `update` folds one observation into the stats map.
pub trait Bandit: Send {
    fn select(&mut self, operators: &[String], stats: &StatsMap, rng: &mut StdRng) -> String;

    fn update(&self, name: &str, reward: f64, stats: &mut StatsMap) {
        update_stats(stats, name, reward);
    }

    /// Diagnostic scores; empty for policies without a confidence term.
    fn scores(&self, _operators: &[String], _stats: &StatsMap) -> HashMap<String, f64> {
        HashMap::new()
    }
}

/// Deterministic argmax: strictly-greater wins, equal values break toward
/// the lexicographically smaller operator name.
fn argmax_by<'a, F>(operators: &'a [String], mut value: F) -> Option<&'a String>
where
    F: FnMut(&str) -> Option<f64>,
{
    let mut best: Option<(&String, f64)> = None;
    for op in operators {
        let Some(v) = value(op) else { continue };
        match &best {
            Some((best_op, best_v)) => {
                if v > *best_v || (v == *best_v && op.as_str() < best_op.as_str()) {
                    best = Some((op, v));
                }
            }
            None => best = Some((op, v)),
        }
    }
    best.map(|(op, _)| op)
}

pub struct EpsilonGreedy {
    eps: f64,
}

impl EpsilonGreedy {
    pub fn new(eps: f64) -> Self {
        Self { eps }
    }
}

impl Bandit for EpsilonGreedy {
    fn select(&mut self, operators: &[String], stats: &StatsMap, rng: &mut StdRng) -> String {
        // Cold arms first
        let untried: Vec<&String> = operators
            .iter()
            .filter(|op| stats.get(*op).map(|s| s.pulls == 0).unwrap_or(true))
            .collect();
        if let Some(op) = untried.choose(rng) {
            return (*op).clone();
        }

        if rng.gen::<f64>() < self.eps {
            if let Some(op) = operators.choose(rng) {
                return op.clone();
            }
        }

        argmax_by(operators, |op| {
            stats
                .get(op)
                .filter(|s| s.pulls > 0)
                .map(|s| s.avg_reward)
        })
        .cloned()
        .unwrap_or_else(|| operators[0].clone())
    }
}

pub struct Ucb {
    c: f64,
    warm_start_min_pulls: u64,
    stratified_explore: bool,
    stratified_order: Vec<String>,
    stratified_index: usize,
}

impl Ucb {
    pub fn new(c: f64, warm_start_min_pulls: u64, stratified_explore: bool) -> Self {
        Self {
            c,
            warm_start_min_pulls,
            stratified_explore,
            stratified_order: Vec::new(),
            stratified_index: 0,
        }
    }
}

impl Bandit for Ucb {
    fn select(&mut self, operators: &[String], stats: &StatsMap, rng: &mut StdRng) -> String {
        // Stratified first pass: shuffle once, then hand operators out
        // round-robin until every arm has been offered.
        if self.stratified_explore && self.stratified_order.is_empty() {
            self.stratified_order = operators.to_vec();
            self.stratified_order.shuffle(rng);
            self.stratified_index = 0;
        }
        if self.stratified_explore && self.stratified_index < self.stratified_order.len() {
            let selected = self.stratified_order[self.stratified_index].clone();
            self.stratified_index += 1;
            return selected;
        }

        // Warm start: keep pulling arms under the minimum.
        let under_min: Vec<&String> = operators
            .iter()
            .filter(|op| {
                stats
                    .get(*op)
                    .map(|s| s.pulls < self.warm_start_min_pulls)
                    .unwrap_or(true)
            })
            .collect();
        if let Some(op) = under_min.choose(rng) {
            return (*op).clone();
        }

        let total_n: u64 = operators
            .iter()
            .filter_map(|op| stats.get(op).map(|s| s.pulls))
            .sum();
        if total_n == 0 {
            return operators
                .choose(rng)
                .cloned()
                .unwrap_or_else(|| operators[0].clone());
        }

        argmax_by(operators, |op| {
            let s = stats.get(op).filter(|s| s.pulls > 0)?;
            let confidence = self.c * ((total_n as f64).ln() / s.pulls as f64).sqrt();
            Some(s.mean_payoff + confidence)
        })
        .cloned()
        .unwrap_or_else(|| operators[0].clone())
    }

    fn scores(&self, operators: &[String], stats: &StatsMap) -> HashMap<String, f64> {
        let total_n: u64 = operators
            .iter()
            .filter_map(|op| stats.get(op).map(|s| s.pulls))
            .sum();
        operators
            .iter()
            .map(|op| {
                let score = match stats.get(op).filter(|s| s.pulls > 0) {
                    Some(s) if total_n > 0 => {
                        let confidence =
                            self.c * ((total_n as f64).ln() / s.pulls as f64).sqrt();
                        s.mean_payoff + confidence
                    }
                    // Untried arms dominate so exploration is guaranteed.
                    _ => f64::INFINITY,
                };
                (op.clone(), score)
            })
            .collect()
    }
}
