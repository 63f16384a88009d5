//! FFT plan cache
//!
//! Owned by a [`SpectralEngine`](super::spectral::SpectralEngine) instance. Plans are keyed
//! by frame size, created on first use and dropped only by [`FftCache::clear`].

use rustfft::{Fft, FftPlanner};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

pub struct FftCache {
    planner: Mutex<FftPlanner<f32>>,
    plans: RwLock<HashMap<usize, Arc<dyn Fft<f32>>>>,
}

impl Default for FftCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FftCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FftCache")
            .field("cached_sizes", &self.cached_sizes())
            .finish()
    }
}

impl FftCache {
    pub fn new() -> Self {
        Self {
            planner: Mutex::new(FftPlanner::new()),
            plans: RwLock::new(HashMap::new()),
        }
    }

    /// Forward FFT plan for `size`
    pub fn forward(&self, size: usize) -> Arc<dyn Fft<f32>> {
        if let Some(plan) = self
            .plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&size)
        {
            return Arc::clone(plan);
        }

        let plan = self
            .planner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .plan_fft_forward(size);

        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(plans.entry(size).or_insert(plan))
    }

    /// Drop every cached plan, including the planner's internal cache
    pub fn clear(&self) {
        *self.planner.lock().unwrap_or_else(PoisonError::into_inner) = FftPlanner::new();
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn cached_sizes(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = self
            .plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        sizes.sort_unstable();
        sizes
    }
}
