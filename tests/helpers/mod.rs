//! Test helper utilities shared by the integration suites

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batch_annotate::models::annotation::{Annotation, AnnotationSet};
use batch_annotate::models::batch::ProgressSnapshot;
use batch_annotate::models::tier::ServiceTier;
use batch_annotate::services::clock::{Clock, ManualClock};
use batch_annotate::services::generator::{AnnotationGenerator, GenerateError};
use batch_annotate::services::job_store::JobStore;
use batch_annotate::services::processor::{BatchProcessor, ProcessorConfig};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use uuid::Uuid;

/// How the scripted provider answers for one item.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    /// 400-class rejection on every attempt.
    FailPermanently,
    /// 503 for the first `times` attempts, then success.
    FailTransiently { times: u32 },
    /// Connection refused on every attempt.
    Unreachable,
}

/// In-process stand-in for the annotation provider that records how it
/// was called.
pub struct ScriptedGenerator {
    scripts: HashMap<String, Script>,
    default: Script,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    clock: Option<Arc<ManualClock>>,
    attempts: Mutex<HashMap<String, u32>>,
    call_times: Mutex<Vec<DateTime<Utc>>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            default: Script::Succeed,
            delay: Duration::ZERO,
            gate: None,
            clock: None,
            attempts: Mutex::new(HashMap::new()),
            call_times: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, item_id: &str, script: Script) -> Self {
        self.scripts.insert(item_id.to_string(), script);
        self
    }

    pub fn with_default(mut self, script: Script) -> Self {
        self.default = script;
        self
    }

    /// Real-time latency of every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Each call consumes one permit before answering.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Record the virtual time of every call.
    pub fn timed_by(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn attempts_for(&self, item_id: &str) -> u32 {
        self.attempts.lock().get(item_id).copied().unwrap_or(0)
    }

    pub fn call_times(&self) -> Vec<DateTime<Utc>> {
        let mut times = self.call_times.lock().clone();
        times.sort();
        times
    }
}

#[async_trait]
impl AnnotationGenerator for ScriptedGenerator {
    async fn generate(&self, item_id: &str) -> Result<AnnotationSet, GenerateError> {
        if let Some(clock) = &self.clock {
            self.call_times.lock().push(clock.now());
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let attempt = {
            let mut attempts = self.attempts.lock();
            let n = attempts.entry(item_id.to_string()).or_insert(0);
            *n += 1;
            *n
        };

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let script = self.scripts.get(item_id).unwrap_or(&self.default);
        match script {
            Script::Succeed => Ok(annotations_for(item_id)),
            Script::FailPermanently => Err(GenerateError::Client {
                status: 400,
                message: "image could not be decoded".to_string(),
            }),
            Script::FailTransiently { times } if attempt <= *times => Err(GenerateError::Server {
                status: 503,
                message: "model overloaded".to_string(),
            }),
            Script::FailTransiently { .. } => Ok(annotations_for(item_id)),
            Script::Unreachable => Err(GenerateError::Unavailable(
                "connection refused".to_string(),
            )),
        }
    }
}

pub fn annotations_for(item_id: &str) -> AnnotationSet {
    AnnotationSet {
        item_id: item_id.to_string(),
        annotations: vec![Annotation {
            label: "Quercus robur".to_string(),
            confidence: 0.91,
            bbox: Some([0.1, 0.2, 0.5, 0.6]),
        }],
        model: Some("scripted".to_string()),
    }
}

pub fn paid_config() -> ProcessorConfig {
    ProcessorConfig {
        tier: ServiceTier::Paid,
        ..ProcessorConfig::default()
    }
}

/// Processor on virtual time: backoff and rate-limit waits finish instantly.
pub fn processor_with(
    generator: Arc<ScriptedGenerator>,
    config: ProcessorConfig,
) -> (BatchProcessor, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let processor = processor_on(generator, clock.clone(), config);
    (processor, clock)
}

pub fn processor_on(
    generator: Arc<ScriptedGenerator>,
    clock: Arc<ManualClock>,
    config: ProcessorConfig,
) -> BatchProcessor {
    BatchProcessor::new(config, Arc::new(JobStore::new()), generator, clock)
}

/// Poll progress until `done` holds (with timeout)
pub async fn wait_until(
    processor: &BatchProcessor,
    job_id: Uuid,
    done: impl Fn(&ProgressSnapshot) -> bool,
) -> ProgressSnapshot {
    for _ in 0..2_000 {
        let snapshot = processor
            .get_job_progress(job_id)
            .expect("job should exist while polling");
        if done(&snapshot) {
            return snapshot;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("job {job_id} did not reach the expected state within 10 seconds");
}

/// Poll progress until the job reaches a terminal status
pub async fn wait_for_terminal(processor: &BatchProcessor, job_id: Uuid) -> ProgressSnapshot {
    wait_until(processor, job_id, |s| s.status.is_terminal()).await
}
