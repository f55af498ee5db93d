use std::fmt;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::context::{SamplingContext, TransactionContext};

pub type SamplerFn = dyn Fn(&SamplingContext<'_>) -> bool + Send + Sync;

#[derive(Clone)]
enum Strategy {
    Rate(f64),
    Custom(Arc<SamplerFn>),
}

/// Decides once per transaction whether it will ever be sent.
pub struct Sampler {
    strategy: Strategy,
    rng: Mutex<StdRng>,
}

impl Sampler {
    /// Samples with probability `rate`; a sampled or unsampled parent wins over the rate.
    pub fn rate(rate: f64) -> Self {
        Self {
            strategy: Strategy::Rate(rate),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Full override: the function's answer is final.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&SamplingContext<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            strategy: Strategy::Custom(Arc::new(f)),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn sample(&self, ctx: &SamplingContext<'_>) -> bool {
        match &self.strategy {
            Strategy::Custom(f) => f(ctx),
            Strategy::Rate(rate) => match ctx.parent_sampled {
                Some(parent) => parent,
                None => self.draw(*rate),
            },
        }
    }

    fn draw(&self, rate: f64) -> bool {
        if !(0.0..=1.0).contains(&rate) {
            warn!(rate, "sample rate must be between 0 and 1; not sampling");
            return false;
        }
        if rate == 0.0 {
            return false;
        }
        let roll: f64 = self
            .rng
            .lock()
            .expect("sampler rng poisoned")
            .gen_range(0.0..1.0);
        roll < rate
    }
}

impl fmt::Debug for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.strategy {
            Strategy::Rate(rate) => f.debug_tuple("Sampler::Rate").field(rate).finish(),
            Strategy::Custom(_) => f.write_str("Sampler::Custom"),
        }
    }
}

/// The single sampling decision for a new transaction. An explicit
/// `sampled` on the context wins; without a sampler nothing is sampled.
pub fn init_sampling(sampler: Option<&Sampler>, ctx: &TransactionContext) -> bool {
    if let Some(forced) = ctx.sampled {
        return forced;
    }
    match sampler {
        Some(sampler) => sampler.sample(&SamplingContext::new(ctx)),
        None => false,
    }
}
