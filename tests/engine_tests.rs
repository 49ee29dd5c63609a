use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use burn_rolling_sink::config::AdmissionPolicy;
use burn_rolling_sink::{Engine, GenerationRequest, Result, RollingSinkError, VideoGenerator};

/// Counts requests and the peak number running at once.
struct SlowGenerator {
    served: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl VideoGenerator for SlowGenerator {
    type Output = usize;

    fn generate(&mut self, _request: &GenerationRequest) -> Result<usize> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(5));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.served += 1;
        Ok(self.served)
    }
}

fn counting_engine(admission: AdmissionPolicy) -> (Engine<SlowGenerator>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let builds = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (b, p) = (builds.clone(), peak.clone());
    let engine = Engine::new(admission, move || {
        b.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        Ok(SlowGenerator {
            served: 0,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: p.clone(),
        })
    });
    (engine, builds, peak)
}

fn request() -> GenerationRequest {
    GenerationRequest::new("a lighthouse", 5.0)
}

#[test]
fn model_is_built_once_under_concurrent_first_requests() {
    let (engine, builds, peak) = counting_engine(AdmissionPolicy::Queue);
    assert!(!engine.is_initialized());

    let mut served: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..8).map(|_| s.spawn(|| engine.generate(&request()))).collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect()
    });

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    served.sort_unstable();
    assert_eq!(served, (1..=8).collect::<Vec<_>>());
    assert!(engine.is_initialized());
}

#[test]
fn reject_policy_returns_busy_while_a_request_runs() {
    let (engine, _, _) = counting_engine(AdmissionPolicy::Reject);
    engine.warm_up().unwrap();
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let shared = &engine;
    thread::scope(|s| {
        s.spawn(move || {
            shared
                .with_generator(|_| {
                    held_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                })
                .unwrap();
        });
        held_rx.recv().unwrap();
        assert!(matches!(engine.generate(&request()), Err(RollingSinkError::Busy)));
        release_tx.send(()).unwrap();
    });

    assert_eq!(engine.generate(&request()).unwrap(), 1);
}

#[test]
fn failed_initialisation_is_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    let engine = Engine::new(AdmissionPolicy::Queue, move || {
        if a.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(RollingSinkError::Configuration("weights missing".into()));
        }
        Ok(SlowGenerator {
            served: 0,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })
    });

    assert!(matches!(engine.warm_up(), Err(RollingSinkError::Configuration(_))));
    assert!(!engine.is_initialized());
    engine.warm_up().unwrap();
    assert!(engine.is_initialized());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
