//! Process-wide engine handle: lazy one-time model construction and single-flight admission.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::AdmissionPolicy;
use crate::error::{Result, RollingSinkError};
use crate::generate::{GenerationRequest, VideoGenerator};

type Factory<G> = Box<dyn Fn() -> Result<G> + Send + Sync>;

/// Owns the single generator instance of the process.
///
/// The generator (model weights, cache and decoder) is built by `factory` on first
/// use; concurrent first callers block until that one construction finishes. A
/// failed construction is not memoized, so the next call retries it. Requests
/// then run one at a time under a mutex.
pub struct Engine<G: VideoGenerator> {
    factory: Factory<G>,
    generator: OnceCell<Mutex<G>>,
    admission: AdmissionPolicy,
}

impl<G: VideoGenerator> Engine<G> {
    pub fn new<F>(admission: AdmissionPolicy, factory: F) -> Self
    where
        F: Fn() -> Result<G> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            generator: OnceCell::new(),
            admission,
        }
    }

    pub fn admission(&self) -> AdmissionPolicy {
        self.admission
    }

    pub fn is_initialized(&self) -> bool {
        self.generator.get().is_some()
    }

    /// Builds the generator now so configuration errors surface before any request.
    pub fn warm_up(&self) -> Result<()> {
        self.instance().map(|_| ())
    }

    fn instance(&self) -> Result<&Mutex<G>> {
        self.generator.get_or_try_init(|| {
            info!("initializing generation model");
            let generator = (self.factory)()?;
            info!("generation model ready");
            Ok(Mutex::new(generator))
        })
    }

    /// Runs one request. With `Reject` admission a concurrent caller gets `Busy`.
    pub fn generate(&self, request: &GenerationRequest) -> Result<G::Output> {
        let instance = self.instance()?;
        let mut generator = match self.admission {
            AdmissionPolicy::Queue => instance.lock(),
            AdmissionPolicy::Reject => instance.try_lock().ok_or_else(|| {
                debug!("rejecting request, generator busy");
                RollingSinkError::Busy
            })?,
        };
        generator.generate(request)
    }

    /// Runs `f` with exclusive access to the generator.
    pub fn with_generator<R>(&self, f: impl FnOnce(&mut G) -> R) -> Result<R> {
        let instance = self.instance()?;
        let mut generator = instance.lock();
        Ok(f(&mut generator))
    }
}
