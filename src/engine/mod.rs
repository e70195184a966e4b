//! Generation machinery driven by a [`Session`](crate::Session).
//!
//! - [`LoadedModel`]: the model, context and sampler chain of a loaded session
//! - [`generate`]: prompt decode and the token loop
//! - [`sampler`]: sampler-chain stages and the CPU reference chain

pub mod generate;
pub mod sampler;

use tracing::debug;

use crate::backend::InferenceBackend;
use crate::config::SamplingParams;
use crate::error::Result;

pub use generate::{GenerationOutput, StopReason};
pub use sampler::{build_sampler_chain, CpuSamplerChain, SamplerStage};

/// Engine handles of a loaded model.
///
/// Fields drop in declaration order, so the sampler chain is released before
/// the context and the context before the model it was created from. The
/// sampler is `None` only while a rebuild is in progress or after one failed.
pub struct LoadedModel<B: InferenceBackend> {
    pub(crate) sampler: Option<B::Sampler>,
    pub(crate) context: B::Context,
    pub(crate) model: B::Model,
    /// Parameters the live sampler chain was built from.
    sampling: SamplingParams,
}

impl<B: InferenceBackend> LoadedModel<B> {
    pub(crate) fn new(
        model: B::Model,
        context: B::Context,
        sampler: B::Sampler,
        sampling: SamplingParams,
    ) -> Self {
        Self { sampler: Some(sampler), context, model, sampling }
    }

    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    /// Rebuild the sampler chain if `params` differ from the live one, or
    /// unconditionally when `params` carry no seed so each call draws a fresh
    /// one. Returns whether a rebuild happened.
    ///
    /// The old chain is freed before the new one is built, so at most one
    /// chain is ever live. If the build fails the model has no chain until the
    /// next successful call.
    pub(crate) fn apply_sampling(&mut self, backend: &B, params: &SamplingParams) -> Result<bool> {
        if self.sampler.is_some() && params.seed.is_some() && self.sampling == *params {
            return Ok(false);
        }
        if self.sampler.take().is_some() {
            debug!("Sampler chain freed for rebuild");
        }
        self.sampler = Some(build_sampler_chain(backend, &self.model, params)?);
        self.sampling = *params;
        Ok(true)
    }

    /// Release the handles one by one, sampler first.
    pub(crate) fn release(self) {
        let LoadedModel { sampler, context, model, .. } = self;
        drop(sampler);
        debug!("Sampler chain freed");
        drop(context);
        debug!("Context freed");
        drop(model);
        debug!("Model freed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{StubBackend, StubOptions};
    use crate::config::LlamaConfig;

    fn loaded(backend: &StubBackend) -> (tempfile::NamedTempFile, LoadedModel<StubBackend>) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = LlamaConfig { seed: Some(3), ..Default::default() };
        let model = backend.load_model(file.path(), &config.model_params()).unwrap();
        let context = backend.new_context(&model, &config.context_params()).unwrap();
        let sampling = config.sampling_params();
        let sampler = build_sampler_chain(backend, &model, &sampling).unwrap();
        (file, LoadedModel::new(model, context, sampler, sampling))
    }

    #[test]
    fn test_apply_sampling_rebuilds_only_on_change() {
        let backend = StubBackend::new();
        let counters = backend.counters();
        let (_file, mut loaded) = loaded(&backend);
        assert_eq!(counters.total_samplers(), 1);

        let same = *loaded.sampling();
        assert!(!loaded.apply_sampling(&backend, &same).unwrap());
        assert_eq!(counters.total_samplers(), 1);

        let greedy = SamplingParams { temperature: 0.0, ..same };
        assert!(loaded.apply_sampling(&backend, &greedy).unwrap());
        assert_eq!(counters.total_samplers(), 2);
        assert_eq!(counters.live_samplers(), 1);
        assert_eq!(counters.peak_samplers(), 1, "old chain freed before the new one is built");
        assert_eq!(loaded.sampling().temperature, 0.0);
    }

    #[test]
    fn test_unseeded_sampling_rebuilds_every_call() {
        let backend = StubBackend::new();
        let counters = backend.counters();
        let (_file, mut loaded) = loaded(&backend);
        let unseeded = SamplingParams { seed: None, ..*loaded.sampling() };
        assert!(loaded.apply_sampling(&backend, &unseeded).unwrap());
        assert!(loaded.apply_sampling(&backend, &unseeded).unwrap());
        assert_eq!(counters.total_samplers(), 3);
        assert_eq!(counters.live_samplers(), 1);
        assert_eq!(counters.peak_samplers(), 1);
    }

    #[test]
    fn test_failed_rebuild_leaves_no_chain() {
        let backend = StubBackend::with_options(StubOptions { fail_sampler: true, ..Default::default() });
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = LlamaConfig { seed: Some(3), ..Default::default() };
        let model = backend.load_model(file.path(), &config.model_params()).unwrap();
        let context = backend.new_context(&model, &config.context_params()).unwrap();
        let sampler = StubBackend::new().sampler_chain(&model).unwrap();
        let mut loaded = LoadedModel::<StubBackend>::new(model, context, sampler, config.sampling_params());

        let greedy = SamplingParams { temperature: 0.0, ..*loaded.sampling() };
        let err = loaded.apply_sampling(&backend, &greedy).unwrap_err();
        assert!(matches!(err, crate::SessionError::SamplerInit(_)));
        assert!(loaded.sampler.is_none());
    }

    #[test]
    fn test_release_frees_everything() {
        let backend = StubBackend::new();
        let counters = backend.counters();
        let (_file, loaded) = loaded(&backend);
        loaded.release();
        assert_eq!(counters.live_samplers(), 0);
        assert_eq!(counters.live_contexts(), 0);
        assert_eq!(counters.live_models(), 0);
    }
}
