#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::Notify;
use uuid::Uuid;

use mailscan::analysis::{
    AnalysisEngine, AnalysisError, AnalysisRequest, EngineVerdict, StaticAnalysisEngine,
};
use mailscan::attachments::AttachmentFetcher;
use mailscan::jobs::{DispatchSettings, Job, JobDispatcher, JobPayload, JobStore, StoreError};
use mailscan::queue::{Delivery, DeliveryId, GroupStatus, QueueConsumer, QueueError};

// ----------------------------
// Backends
// ----------------------------

/// Migrated, empty database from `TEST_DATABASE_URL`, or `None` when the
/// variable is unset so the test can be skipped.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE analysis_jobs")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

/// `TEST_REDIS_URL`, or `None` when unset.
pub fn redis_url() -> Option<String> {
    let _ = dotenvy::dotenv();
    match std::env::var("TEST_REDIS_URL") {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!("TEST_REDIS_URL not set, skipping");
            None
        }
    }
}

/// Stream name no other test run will share.
pub fn unique_stream(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

// ----------------------------
// Queue
// ----------------------------

/// In-memory consumer group for a single consumer. Read-but-unacked
/// deliveries are served again before new ones, like a stream's pending list.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    groups: HashSet<(String, String)>,
    group_creations: usize,
    incoming: VecDeque<Delivery>,
    pending: Vec<Delivery>,
    acks: Vec<DeliveryId>,
    reads: usize,
    failing_reads: usize,
    failing_acks: usize,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_fields(&self, id: &str, fields: &[(&str, &str)]) {
        let delivery = Delivery {
            id: DeliveryId::from(id),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.state.lock().unwrap().incoming.push_back(delivery);
    }

    pub fn push_payload(&self, id: &str, payload: &JobPayload) {
        let fields: HashMap<String, String> = payload
            .to_fields()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        self.state.lock().unwrap().incoming.push_back(Delivery {
            id: DeliveryId::from(id),
            fields,
        });
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.state.lock().unwrap().failing_reads = n;
    }

    /// The next `n` acks fail and leave their delivery pending.
    pub fn fail_next_acks(&self, n: usize) {
        self.state.lock().unwrap().failing_acks = n;
    }

    pub fn acks(&self) -> Vec<DeliveryId> {
        self.state.lock().unwrap().acks.clone()
    }

    pub fn ack_count(&self, id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .acks
            .iter()
            .filter(|a| a.0 == id)
            .count()
    }

    pub fn pending_ids(&self) -> Vec<DeliveryId> {
        self.state
            .lock()
            .unwrap()
            .pending
            .iter()
            .map(|d| d.id.clone())
            .collect()
    }

    pub fn reads(&self) -> usize {
        self.state.lock().unwrap().reads
    }

    pub fn group_creations(&self) -> usize {
        self.state.lock().unwrap().group_creations
    }

    pub fn delivery(&self, id: &str) -> Delivery {
        let state = self.state.lock().unwrap();
        state
            .incoming
            .iter()
            .chain(state.pending.iter())
            .find(|d| d.id.0 == id)
            .cloned()
            .expect("delivery not queued")
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueue {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupStatus, QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.groups.insert((stream.to_string(), group.to_string())) {
            state.group_creations += 1;
            Ok(GroupStatus::Created)
        } else {
            Ok(GroupStatus::AlreadyExists)
        }
    }

    async fn read(
        &self,
        _stream: &str,
        _group: &str,
        _consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let batch: Vec<Delivery> = {
            let mut state = self.state.lock().unwrap();
            state.reads += 1;
            if state.failing_reads > 0 {
                state.failing_reads -= 1;
                return Err(QueueError::Protocol("injected read failure".into()));
            }

            if !state.pending.is_empty() {
                state.pending.iter().take(max_count).cloned().collect()
            } else {
                let mut batch = Vec::new();
                while batch.len() < max_count {
                    match state.incoming.pop_front() {
                        Some(d) => {
                            state.pending.push(d.clone());
                            batch.push(d);
                        }
                        None => break,
                    }
                }
                batch
            }
        };

        if batch.is_empty() {
            tokio::time::sleep(block).await;
        }
        Ok(batch)
    }

    async fn ack(&self, _stream: &str, _group: &str, id: &DeliveryId) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_acks > 0 {
            state.failing_acks -= 1;
            return Err(QueueError::Protocol("injected ack failure".into()));
        }
        state.pending.retain(|d| &d.id != id);
        state.acks.push(id.clone());
        Ok(())
    }
}

// ----------------------------
// Store
// ----------------------------

#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    gets: AtomicUsize,
    saves: AtomicUsize,
    failing_gets: AtomicUsize,
    failing_saves: AtomicUsize,
    stall_saves: AtomicBool,
}

fn injected() -> StoreError {
    StoreError::Database(sqlx::Error::Protocol("injected store failure".into()))
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_pending(&self) -> Uuid {
        let job = Job::pending(Uuid::new_v4());
        let id = job.id;
        self.jobs.lock().unwrap().insert(id, job);
        id
    }

    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Successful saves so far.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn fail_next_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    pub fn stall_saves(&self, stall: bool) {
        self.stall_saves.store(stall, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_gets) {
            return Err(injected());
        }
        Ok(self.job(id))
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        if self.stall_saves.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if Self::take_failure(&self.failing_saves) {
            return Err(injected());
        }

        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                self.saves.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(StoreError::NotFound(job.id)),
        }
    }
}

// ----------------------------
// Collaborators
// ----------------------------

/// Answers by attachment id: known ids return their bytes (or `None`),
/// `"panic"` panics, anything else is absent.
#[derive(Default)]
pub struct ScriptedFetcher {
    answers: HashMap<String, Option<Vec<u8>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedFetcher {
    pub fn new(answers: &[(&str, Option<usize>)]) -> Arc<Self> {
        Arc::new(Self {
            answers: answers
                .iter()
                .map(|(id, len)| (id.to_string(), len.map(|n| vec![0u8; n])))
                .collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AttachmentFetcher for ScriptedFetcher {
    async fn fetch(&self, message_id: &str, attachment_id: &str) -> Option<Vec<u8>> {
        self.calls
            .lock()
            .unwrap()
            .push((message_id.to_string(), attachment_id.to_string()));
        if attachment_id == "panic" {
            panic!("fetcher blew up");
        }
        self.answers.get(attachment_id).cloned().flatten()
    }
}

pub struct FailingEngine;

#[async_trait]
impl AnalysisEngine for FailingEngine {
    async fn analyze(&self, _request: &AnalysisRequest) -> Result<EngineVerdict, AnalysisError> {
        Err(AnalysisError::Engine("sandbox unavailable".into()))
    }
}

pub struct PanickingEngine;

#[async_trait]
impl AnalysisEngine for PanickingEngine {
    async fn analyze(&self, _request: &AnalysisRequest) -> Result<EngineVerdict, AnalysisError> {
        panic!("engine bug");
    }
}

/// Signals when analysis starts and holds it until released.
pub struct GateEngine {
    pub started: Notify,
    pub release: Notify,
}

impl GateEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl AnalysisEngine for GateEngine {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<EngineVerdict, AnalysisError> {
        self.started.notify_one();
        self.release.notified().await;
        StaticAnalysisEngine::new(Duration::ZERO).analyze(request).await
    }
}

// ----------------------------
// Wiring
// ----------------------------

pub fn clean_engine() -> Arc<dyn AnalysisEngine> {
    Arc::new(StaticAnalysisEngine::new(Duration::ZERO))
}

pub fn no_attachments() -> Arc<ScriptedFetcher> {
    ScriptedFetcher::new(&[])
}

pub fn dispatcher(
    store: Arc<MemoryStore>,
    fetcher: Arc<dyn AttachmentFetcher>,
    engine: Arc<dyn AnalysisEngine>,
) -> JobDispatcher {
    JobDispatcher::new(
        store,
        fetcher,
        engine,
        DispatchSettings {
            attachment_concurrency: 2,
            store_timeout: Duration::from_millis(200),
        },
    )
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
