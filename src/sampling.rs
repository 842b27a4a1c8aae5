use std::cmp::Ordering;
use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Penalties at or below `1 + REPETITION_EPSILON` are treated as disabled
const REPETITION_EPSILON: f32 = 1e-6;

/// Temperatures below this value select the argmax
const GREEDY_TEMPERATURE: f32 = 1e-6;

/// Per-request sampling knobs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 0.95,
            repetition_penalty: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    token_id: u32,
    prob: f32,
}

/// Token sampler over full-vocabulary logits with a seeded source.
///
/// Identical logits, parameters and seed always yield the same token.
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn sample(&mut self, logits: &[f32], params: &SamplingParams, appeared: &HashSet<u32>) -> u32 {
        if logits.is_empty() {
            return 0;
        }

        let mut logits = logits.to_vec();
        if params.repetition_penalty > 1.0 + REPETITION_EPSILON {
            apply_repetition_penalty(&mut logits, params.repetition_penalty, appeared);
        }

        if params.temperature < GREEDY_TEMPERATURE {
            return argmax(&logits);
        }

        let candidates = nucleus(&logits, params.temperature, params.top_p);
        let mass: f32 = candidates.iter().map(|c| c.prob).sum();
        let target = self.rng.gen::<f32>() * mass;

        let mut cumulative = 0.0f32;
        for candidate in &candidates {
            cumulative += candidate.prob;
            if target < cumulative {
                return candidate.token_id;
            }
        }
        // Rounding can leave the target just above the last bucket
        candidates.last().map(|c| c.token_id).unwrap_or(0)
    }
}

fn apply_repetition_penalty(logits: &mut [f32], penalty: f32, appeared: &HashSet<u32>) {
    for &token in appeared {
        if let Some(logit) = logits.get_mut(token as usize) {
            if *logit > 0.0 {
                *logit /= penalty;
            } else {
                *logit *= penalty;
            }
        }
    }
}

/// Highest logit; the lowest id wins ties
fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, &logit) in logits.iter().enumerate().skip(1) {
        if logit > logits[best] {
            best = i;
        }
    }
    best as u32
}

/// Smallest probability-ordered prefix whose mass reaches `top_p`
fn nucleus(logits: &[f32], temperature: f32, top_p: f32) -> Vec<Candidate> {
    let scaled: Vec<f32> = logits.iter().map(|l| l / temperature).collect();
    let max_logit = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scaled.iter().map(|l| (l - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();

    let mut candidates: Vec<Candidate> = exps
        .iter()
        .enumerate()
        .map(|(i, e)| Candidate {
            token_id: i as u32,
            prob: e / sum,
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.prob
            .partial_cmp(&a.prob)
            .unwrap_or(Ordering::Equal)
            .then(a.token_id.cmp(&b.token_id))
    });

    let mut cumulative = 0.0f32;
    let mut cutoff = candidates.len();
    for (i, candidate) in candidates.iter().enumerate() {
        cumulative += candidate.prob;
        if cumulative >= top_p {
            cutoff = i + 1;
            break;
        }
    }
    candidates.truncate(cutoff.max(1));
    candidates
}
