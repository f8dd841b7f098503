//! Deterministic stand-ins for the embedding model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::semantic::embeddings::{Embedder, EmbedderLoader, EmbeddingError};
use crate::semantic::protocol::Progress;
use crate::semantic::worker::ThreadSpawner;
use crate::semantic::{ComputeBridge, LifecycleStatus, ModelManager};

pub const FAKE_DIMENSIONS: usize = 64;
pub const FAKE_MODEL: &str = "fake-model";

/// Bag-of-words vector: each lowercase alphanumeric token bumps one FNV-1a bucket.
pub fn vectorize(text: &str) -> Vec<f32> {
    let mut v = vec![0.0; FAKE_DIMENSIONS];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in token.to_lowercase().bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        v[(hash % FAKE_DIMENSIONS as u64) as usize] += 1.0;
    }
    v
}

/// Every batch the fake model was asked to embed.
#[derive(Default)]
pub struct Recorder {
    batches: Mutex<Vec<Vec<String>>>,
}

impl Recorder {
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches().iter().map(|b| b.len()).collect()
    }
}

/// Blocks the worker on the first batch containing `marker` until released.
struct Hold {
    marker: String,
    reached: Notify,
    released: Mutex<bool>,
    cond: Condvar,
}

#[derive(Clone)]
pub struct FakeLoader {
    pub recorder: Arc<Recorder>,
    loads: Arc<AtomicUsize>,
    load_error: Option<String>,
    fail_marker: Option<String>,
    hold: Option<Arc<Hold>>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self {
            recorder: Arc::new(Recorder::default()),
            loads: Arc::new(AtomicUsize::new(0)),
            load_error: None,
            fail_marker: None,
            hold: None,
        }
    }

    /// Every model load fails with `message`.
    pub fn fail_load(mut self, message: &str) -> Self {
        self.load_error = Some(message.to_string());
        self
    }

    /// Number of times the model was loaded (or attempted).
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Batches with a text containing `marker` fail with a remote error.
    pub fn fail_on(mut self, marker: &str) -> Self {
        self.fail_marker = Some(marker.to_string());
        self
    }

    pub fn hold_on(mut self, marker: &str) -> Self {
        self.hold = Some(Arc::new(Hold {
            marker: marker.to_string(),
            reached: Notify::new(),
            released: Mutex::new(false),
            cond: Condvar::new(),
        }));
        self
    }

    pub async fn wait_until_held(&self) {
        if let Some(hold) = &self.hold {
            hold.reached.notified().await;
        }
    }

    pub fn release(&self) {
        if let Some(hold) = &self.hold {
            *hold.released.lock().unwrap() = true;
            hold.cond.notify_all();
        }
    }
}

impl EmbedderLoader for FakeLoader {
    fn load(
        &self,
        report: &mut dyn FnMut(&str, Option<Progress>),
    ) -> Result<Box<dyn Embedder>, EmbeddingError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        report("loading fake model", Some(Progress { current: 1, total: 1 }));
        if let Some(message) = &self.load_error {
            return Err(EmbeddingError::InitFailed(message.clone()));
        }
        Ok(Box::new(FakeEmbedder {
            loader: self.clone(),
        }))
    }
}

struct FakeEmbedder {
    loader: FakeLoader,
}

impl Embedder for FakeEmbedder {
    fn model_name(&self) -> &str {
        FAKE_MODEL
    }

    fn dimensions(&self) -> usize {
        FAKE_DIMENSIONS
    }

    fn embed_batch(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.loader
            .recorder
            .batches
            .lock()
            .unwrap()
            .push(texts.to_vec());

        if let Some(hold) = &self.loader.hold {
            if texts.iter().any(|t| t.contains(&hold.marker)) {
                hold.reached.notify_one();
                let mut released = hold.released.lock().unwrap();
                while !*released {
                    released = hold.cond.wait(released).unwrap();
                }
            }
        }

        if let Some(marker) = &self.loader.fail_marker {
            if texts.iter().any(|t| t.contains(marker)) {
                return Err(EmbeddingError::EmbeddingFailed(
                    "simulated failure".to_string(),
                ));
            }
        }

        Ok(texts.iter().map(|t| vectorize(t)).collect())
    }
}

/// A bridge whose worker runs `loader`, already initialized.
pub async fn fake_bridge(loader: FakeLoader) -> (Arc<ComputeBridge>, Arc<ModelManager>) {
    let bridge = Arc::new(ComputeBridge::new(Arc::new(ThreadSpawner::new(Arc::new(
        loader,
    )))));
    let manager = Arc::new(ModelManager::new(
        bridge.clone(),
        true,
        Duration::from_secs(10),
    ));
    assert_eq!(manager.initialize().await, LifecycleStatus::Ready);
    (bridge, manager)
}
