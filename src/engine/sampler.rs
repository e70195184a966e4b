//! Sampler chain construction and a pure-Rust reference implementation.
//!
//! The chain is an ordered list of [`SamplerStage`]s derived from
//! [`SamplingParams`]. Order matters: penalties before truncation, truncation
//! before temperature, and the seeded distribution draw last.

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasher, Hasher};

use tracing::info;

use crate::backend::{InferenceBackend, TokenId};
use crate::config::SamplingParams;
use crate::error::{Result, SessionError};

/// Number of most recent tokens the repetition penalty looks at.
pub const PENALTY_LAST_N: usize = 64;

/// One stage of a sampler chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerStage {
    /// Penalize tokens seen in the last `last_n` accepted tokens.
    Penalties {
        last_n: usize,
        repeat: f32,
        frequency: f32,
        presence: f32,
    },
    /// Keep the `k` highest logits.
    TopK(u32),
    /// Keep the smallest set whose cumulative probability reaches `p`.
    TopP { p: f32, min_keep: usize },
    /// Divide logits by the temperature.
    Temperature(f32),
    /// Draw from the softmax distribution with a seeded RNG.
    Distribution { seed: u32 },
}

/// Resolve the configured seed, drawing a fresh random one when unset.
pub fn resolve_seed(seed: Option<u32>) -> u32 {
    seed.unwrap_or_else(random_seed)
}

/// Process-random seed from the std hasher keys; differs on every call.
fn random_seed() -> u32 {
    RandomState::new().build_hasher().finish() as u32
}

/// The ordered stages for `params`. Optional stages are left out when their
/// setting is neutral; the distribution stage is always last.
pub fn sampler_stages(params: &SamplingParams) -> Vec<SamplerStage> {
    let mut stages = Vec::with_capacity(5);
    if params.repeat_penalty != 1.0 {
        stages.push(SamplerStage::Penalties {
            last_n: PENALTY_LAST_N,
            repeat: params.repeat_penalty,
            frequency: 0.0,
            presence: 0.0,
        });
    }
    if params.top_k > 0 {
        stages.push(SamplerStage::TopK(params.top_k));
    }
    if params.top_p < 1.0 {
        stages.push(SamplerStage::TopP { p: params.top_p, min_keep: 1 });
    }
    if params.temperature > 0.0 {
        stages.push(SamplerStage::Temperature(params.temperature));
    }
    stages.push(SamplerStage::Distribution { seed: resolve_seed(params.seed) });
    stages
}

/// Build a backend sampler chain for `params`.
pub fn build_sampler_chain<B: InferenceBackend>(
    backend: &B,
    model: &B::Model,
    params: &SamplingParams,
) -> Result<B::Sampler> {
    let mut chain = backend.sampler_chain(model).map_err(SessionError::SamplerInit)?;
    for stage in sampler_stages(params) {
        backend.sampler_chain_add(&mut chain, stage);
    }
    info!(
        temperature = params.temperature,
        top_p = params.top_p,
        top_k = params.top_k,
        repeat_penalty = params.repeat_penalty,
        seed = ?params.seed,
        "Sampler configured"
    );
    Ok(chain)
}

/// Simple XorShift64 RNG for the distribution stage.
#[derive(Debug, Clone)]
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    /// Create a new RNG from a seed. Seed of 0 is adjusted to 1.
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Generate a random f32 in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Sampler chain evaluated on the host over a full logits vector.
#[derive(Debug, Clone)]
pub struct CpuSamplerChain {
    stages: Vec<SamplerStage>,
    rng: XorShiftRng,
    history: VecDeque<TokenId>,
}

impl Default for CpuSamplerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSamplerChain {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            rng: XorShiftRng::new(0),
            history: VecDeque::with_capacity(PENALTY_LAST_N),
        }
    }

    pub fn from_stages(stages: &[SamplerStage]) -> Self {
        let mut chain = Self::new();
        for &stage in stages {
            chain.add(stage);
        }
        chain
    }

    pub fn add(&mut self, stage: SamplerStage) {
        if let SamplerStage::Distribution { seed } = stage {
            self.rng = XorShiftRng::new(seed as u64);
        }
        self.stages.push(stage);
    }

    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    /// Reseed the RNG and forget accepted tokens.
    pub fn reset(&mut self) {
        let seed = self.stages.iter().rev().find_map(|s| match s {
            SamplerStage::Distribution { seed } => Some(*seed),
            _ => None,
        });
        self.rng = XorShiftRng::new(seed.unwrap_or(0) as u64);
        self.history.clear();
    }

    /// Record `token` in the penalty history.
    pub fn accept(&mut self, token: TokenId) {
        if self.history.len() == PENALTY_LAST_N {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }

    /// Run every stage over `logits`, draw a token and accept it.
    ///
    /// Without a distribution stage the highest remaining logit wins.
    pub fn sample(&mut self, logits: &[f32]) -> TokenId {
        if logits.is_empty() {
            return 0;
        }

        let mut candidates: Vec<(TokenId, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (i as TokenId, l))
            .collect();

        let mut chosen = None;
        for stage in &self.stages {
            match *stage {
                SamplerStage::Penalties { last_n, repeat, frequency, presence } => {
                    apply_penalties(&mut candidates, &self.history, last_n, repeat, frequency, presence);
                }
                SamplerStage::TopK(k) => {
                    let k = k as usize;
                    if k > 0 && k < candidates.len() {
                        sort_descending(&mut candidates);
                        candidates.truncate(k);
                    }
                }
                SamplerStage::TopP { p, min_keep } => {
                    if p < 1.0 {
                        sort_descending(&mut candidates);
                        let probs = softmax(&candidates);
                        let mut cumulative = 0.0f32;
                        let mut keep = candidates.len();
                        for (i, prob) in probs.iter().enumerate() {
                            cumulative += prob;
                            if cumulative >= p && i + 1 >= min_keep {
                                keep = i + 1;
                                break;
                            }
                        }
                        candidates.truncate(keep);
                    }
                }
                SamplerStage::Temperature(t) => {
                    if t > 0.0 {
                        for c in &mut candidates {
                            c.1 /= t;
                        }
                    }
                }
                SamplerStage::Distribution { .. } => {
                    let probs = softmax(&candidates);
                    let r = self.rng.next_f32();
                    let mut cumulative = 0.0f32;
                    // Rounding can leave `r` above the final cumulative sum.
                    let mut pick = candidates
                        .iter()
                        .zip(&probs)
                        .rev()
                        .find(|(_, &prob)| prob > 0.0)
                        .map(|(c, _)| c.0);
                    for (c, prob) in candidates.iter().zip(&probs) {
                        cumulative += prob;
                        if r < cumulative {
                            pick = Some(c.0);
                            break;
                        }
                    }
                    chosen = pick;
                    break;
                }
            }
        }

        let token = chosen.unwrap_or_else(|| {
            candidates
                .iter()
                .fold((0, f32::NEG_INFINITY), |best, c| if c.1 > best.1 { *c } else { best })
                .0
        });
        self.accept(token);
        token
    }
}

fn apply_penalties(
    candidates: &mut [(TokenId, f32)],
    history: &VecDeque<TokenId>,
    last_n: usize,
    repeat: f32,
    frequency: f32,
    presence: f32,
) {
    let skip = history.len().saturating_sub(last_n);
    let mut counts: HashMap<TokenId, usize> = HashMap::new();
    for &token in history.iter().skip(skip) {
        *counts.entry(token).or_insert(0) += 1;
    }
    if counts.is_empty() {
        return;
    }
    for c in candidates.iter_mut() {
        if let Some(&count) = counts.get(&c.0) {
            if c.1 <= 0.0 {
                c.1 *= repeat;
            } else {
                c.1 /= repeat;
            }
            c.1 -= count as f32 * frequency + presence;
        }
    }
}

fn sort_descending(candidates: &mut [(TokenId, f32)]) {
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
}

fn softmax(candidates: &[(TokenId, f32)]) -> Vec<f32> {
    let max_logit = candidates.iter().map(|c| c.1).fold(f32::NEG_INFINITY, f32::max);
    if !max_logit.is_finite() {
        let uniform = 1.0 / candidates.len().max(1) as f32;
        return vec![uniform; candidates.len()];
    }
    let exps: Vec<f32> = candidates.iter().map(|c| (c.1 - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
