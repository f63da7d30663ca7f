//! Per-scale model cache with single-flight construction.

use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::Instant;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::UpscaleError;
use crate::types::ScaleFactor;

/// Builds a model for one scale. The seam between [`ModelCache`] and the
/// concrete network.
pub trait ModelLoader: Send + Sync {
    type Model: Send + Sync;

    fn load(&self, scale: ScaleFactor, use_gpu: bool) -> Result<Self::Model, UpscaleError>;
}

struct Slot<M> {
    model: Arc<M>,
    use_gpu: bool,
}

type SlotCell<M> = Arc<Mutex<Option<Slot<M>>>>;

/// Models keyed by scale only; the first successful load fixes the device.
pub struct ModelCache<L: ModelLoader> {
    loader: L,
    slots: DashMap<ScaleFactor, SlotCell<L::Model>>,
}

impl<L: ModelLoader> ModelCache<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            slots: DashMap::new(),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Return the cached model for `scale`, loading it on first use.
    ///
    /// Concurrent callers for the same scale wait for the in-flight load and
    /// share its result. Failed loads leave the slot empty.
    pub fn get_model(&self, scale: ScaleFactor, use_gpu: bool) -> Result<Arc<L::Model>, UpscaleError> {
        let cell = self.slots.entry(scale).or_default().clone();
        let mut slot = cell.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = slot.as_ref() {
            if existing.use_gpu != use_gpu {
                warn!(
                    %scale,
                    requested_gpu = use_gpu,
                    cached_gpu = existing.use_gpu,
                    "Model already loaded with a different device preference; reusing it"
                );
            }
            return Ok(Arc::clone(&existing.model));
        }

        info!(%scale, use_gpu, "Loading super-resolution model");
        let started = Instant::now();
        let model = Arc::new(self.loader.load(scale, use_gpu)?);
        info!(
            %scale,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Super-resolution model ready"
        );

        *slot = Some(Slot {
            model: Arc::clone(&model),
            use_gpu,
        });
        Ok(model)
    }

    /// Whether a model for `scale` is loaded. A load in progress counts as not loaded.
    pub fn is_loaded(&self, scale: ScaleFactor) -> bool {
        let Some(cell) = self.slots.get(&scale).map(|entry| Arc::clone(entry.value())) else {
            return false;
        };
        let loaded = match cell.try_lock() {
            Ok(slot) => slot.is_some(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_some(),
            Err(TryLockError::WouldBlock) => false,
        };
        loaded
    }

    pub fn cached_scales(&self) -> Vec<ScaleFactor> {
        let mut scales: Vec<ScaleFactor> = ScaleFactor::ALL
            .into_iter()
            .filter(|scale| self.is_loaded(*scale))
            .collect();
        scales.sort();
        scales
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug)]
    struct FakeModel {
        scale: ScaleFactor,
        use_gpu: bool,
    }

    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
        fail_first: bool,
        delay: Option<Duration>,
    }

    impl ModelLoader for CountingLoader {
        type Model = FakeModel;

        fn load(&self, scale: ScaleFactor, use_gpu: bool) -> Result<FakeModel, UpscaleError> {
            let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            if self.fail_first && attempt == 0 {
                return Err(UpscaleError::Fetch {
                    scale: scale.factor(),
                    reason: "HTTP 503".into(),
                });
            }
            Ok(FakeModel { scale, use_gpu })
        }
    }

    #[test]
    fn second_request_reuses_instance() {
        let cache = ModelCache::new(CountingLoader::default());
        let first = cache.get_model(ScaleFactor::X4, true).unwrap();
        let second = cache.get_model(ScaleFactor::X4, true).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.loader().loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_device_preference_wins() {
        let cache = ModelCache::new(CountingLoader::default());
        let gpu = cache.get_model(ScaleFactor::X2, true).unwrap();
        let cpu = cache.get_model(ScaleFactor::X2, false).unwrap();

        assert!(Arc::ptr_eq(&gpu, &cpu));
        assert!(cpu.use_gpu);
        assert_eq!(cache.loader().loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scales_load_independently() {
        let cache = ModelCache::new(CountingLoader::default());
        let x2 = cache.get_model(ScaleFactor::X2, false).unwrap();
        let x8 = cache.get_model(ScaleFactor::X8, false).unwrap();

        assert_eq!(x2.scale, ScaleFactor::X2);
        assert_eq!(x8.scale, ScaleFactor::X8);
        assert_eq!(cache.loader().loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.cached_scales(), vec![ScaleFactor::X2, ScaleFactor::X8]);
    }

    #[test]
    fn failed_load_is_retried() {
        let cache = ModelCache::new(CountingLoader {
            fail_first: true,
            ..CountingLoader::default()
        });

        let err = cache.get_model(ScaleFactor::X4, false).unwrap_err();
        assert!(matches!(err, UpscaleError::Fetch { .. }));
        assert!(!cache.is_loaded(ScaleFactor::X4));

        let model = cache.get_model(ScaleFactor::X4, false).unwrap();
        assert_eq!(model.scale, ScaleFactor::X4);
        assert!(cache.is_loaded(ScaleFactor::X4));
        assert_eq!(cache.loader().loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_first_requests_construct_once() {
        const CALLERS: usize = 8;
        let cache = ModelCache::new(CountingLoader {
            delay: Some(Duration::from_millis(50)),
            ..CountingLoader::default()
        });
        let barrier = Barrier::new(CALLERS);

        let models: Vec<Arc<FakeModel>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..CALLERS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache.get_model(ScaleFactor::X4, true).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(cache.loader().loads.load(Ordering::SeqCst), 1);
        assert!(models.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    #[test]
    fn load_in_progress_is_not_reported_as_loaded() {
        let cache = ModelCache::new(CountingLoader {
            delay: Some(Duration::from_millis(200)),
            ..CountingLoader::default()
        });

        thread::scope(|scope| {
            let loading = scope.spawn(|| cache.get_model(ScaleFactor::X8, false).unwrap());
            while cache.loader().loads.load(Ordering::SeqCst) == 0 {
                thread::yield_now();
            }
            assert!(!cache.is_loaded(ScaleFactor::X8));
            loading.join().unwrap();
        });

        assert!(cache.is_loaded(ScaleFactor::X8));
        assert_eq!(cache.cached_scales(), vec![ScaleFactor::X8]);
    }

    #[test]
    fn empty_cache_reports_nothing_loaded() {
        let cache = ModelCache::new(CountingLoader::default());
        assert!(cache.cached_scales().is_empty());
        assert!(!cache.is_loaded(ScaleFactor::X2));
    }
}
