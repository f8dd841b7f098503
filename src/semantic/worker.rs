//! The compute context: a dedicated thread that owns the embedding model.
//!
//! The worker shares nothing with the host beyond two channels. Requests are
//! handled one at a time in arrival order; every request produces exactly one
//! `Response` with the request's id. Model loading additionally streams
//! `Status` pushes.

use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;

use crate::semantic::embeddings::{Embedder, EmbedderLoader};
use crate::semantic::protocol::{
    Envelope, Progress, StatusPhase, StatusUpdate, WorkerMessage, WorkerReply, WorkerRequest,
};
use crate::semantic::vector_math;

/// Host-side ends of a freshly provisioned compute context.
pub struct ContextChannels {
    pub requests: mpsc::UnboundedSender<Envelope>,
    pub messages: mpsc::UnboundedReceiver<WorkerMessage>,
}

/// Provisions compute contexts for the bridge.
///
/// Called once per enable; the previous context (if any) has already been
/// torn down.
pub trait ContextSpawner: Send + Sync {
    fn spawn(&self) -> std::io::Result<ContextChannels>;
}

/// Spawns a worker thread that loads models through `loader`.
pub struct ThreadSpawner {
    loader: Arc<dyn EmbedderLoader>,
}

impl ThreadSpawner {
    pub fn new(loader: Arc<dyn EmbedderLoader>) -> Self {
        Self { loader }
    }
}

impl ContextSpawner for ThreadSpawner {
    fn spawn(&self) -> std::io::Result<ContextChannels> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            loader: self.loader.clone(),
            embedder: None,
            messages: message_tx,
        };

        thread::Builder::new()
            .name("pathseek-worker".to_string())
            .spawn(move || worker.run(request_rx))?;

        Ok(ContextChannels {
            requests: request_tx,
            messages: message_rx,
        })
    }
}

struct Worker {
    loader: Arc<dyn EmbedderLoader>,
    embedder: Option<Box<dyn Embedder>>,
    messages: mpsc::UnboundedSender<WorkerMessage>,
}

impl Worker {
    fn run(mut self, mut requests: mpsc::UnboundedReceiver<Envelope>) {
        log::debug!("compute worker started");

        // exits once every host-side sender is gone
        while let Some(Envelope { id, request }) = requests.blocking_recv() {
            log::debug!("worker handling call {} ({})", id, request.kind());
            let result = self.handle(request);
            if self
                .messages
                .send(WorkerMessage::Response { id, result })
                .is_err()
            {
                break;
            }
        }

        log::debug!("compute worker stopped");
    }

    fn handle(&mut self, request: WorkerRequest) -> Result<WorkerReply, String> {
        match request {
            WorkerRequest::Init => self.load(),
            WorkerRequest::Embed { texts } => {
                let embedder = self.loaded()?;
                let vectors = embedder.embed_batch(&texts).map_err(|e| e.to_string())?;
                if vectors.len() != texts.len() {
                    return Err(format!(
                        "model returned {} vectors for {} texts",
                        vectors.len(),
                        texts.len()
                    ));
                }
                Ok(WorkerReply::Embeddings {
                    model: embedder.model_name().to_string(),
                    vectors,
                })
            }
            WorkerRequest::Rank {
                query,
                corpus,
                top_k,
            } => {
                let embedder = self.loaded()?;
                let query_vector = embedder
                    .embed_batch(&[query])
                    .map_err(|e| e.to_string())?
                    .into_iter()
                    .next()
                    .ok_or_else(|| "model returned no query vector".to_string())?;
                Ok(WorkerReply::Ranked(vector_math::rank(
                    &query_vector,
                    &corpus,
                    top_k,
                )))
            }
        }
    }

    fn load(&mut self) -> Result<WorkerReply, String> {
        if let Some(embedder) = &self.embedder {
            return Ok(WorkerReply::Loaded {
                model: embedder.model_name().to_string(),
                dimensions: embedder.dimensions(),
            });
        }

        let messages = self.messages.clone();
        let mut report = |message: &str, progress: Option<Progress>| {
            let _ = messages.send(WorkerMessage::Status(StatusUpdate {
                phase: StatusPhase::Loading,
                message: message.to_string(),
                progress,
            }));
        };

        match self.loader.load(&mut report) {
            Ok(embedder) => {
                let reply = WorkerReply::Loaded {
                    model: embedder.model_name().to_string(),
                    dimensions: embedder.dimensions(),
                };
                log::info!(
                    "model '{}' loaded in worker ({} dims)",
                    embedder.model_name(),
                    embedder.dimensions()
                );
                self.push_status(StatusPhase::Ready, "Model ready");
                self.embedder = Some(embedder);
                Ok(reply)
            }
            Err(e) => {
                let message = e.to_string();
                log::error!("model load failed: {}", message);
                self.push_status(StatusPhase::Error, &message);
                Err(message)
            }
        }
    }

    fn loaded(&mut self) -> Result<&mut Box<dyn Embedder>, String> {
        self.embedder
            .as_mut()
            .ok_or_else(|| "model not loaded".to_string())
    }

    fn push_status(&self, phase: StatusPhase, message: &str) {
        let _ = self.messages.send(WorkerMessage::Status(StatusUpdate {
            phase,
            message: message.to_string(),
            progress: None,
        }));
    }
}
