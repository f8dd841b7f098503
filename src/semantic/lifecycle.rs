//! Model readiness state machine on top of the compute bridge.
//!
//! ```text
//! idle -> loading -> ready
//!            |
//!            v
//!          error -> loading (initialize again)
//! any -> disabled -> idle (re-enable provisions a fresh context)
//! ```

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::semantic::bridge::ComputeBridge;
use crate::semantic::protocol::{Progress, WorkerReply, WorkerRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    Idle,
    Loading,
    Ready,
    Error,
    Disabled,
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleStatus::Idle => "idle",
            LifecycleStatus::Loading => "loading",
            LifecycleStatus::Ready => "ready",
            LifecycleStatus::Error => "error",
            LifecycleStatus::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// Everything a presentation layer needs to render model status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub status: LifecycleStatus,
    pub message: Option<String>,
    pub progress: Option<Progress>,
}

impl StatusSnapshot {
    pub fn new(status: LifecycleStatus) -> Self {
        Self {
            status,
            message: None,
            progress: None,
        }
    }
}

/// The model a ready context is serving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedModel {
    pub name: String,
    pub dimensions: usize,
}

pub struct ModelManager {
    bridge: Arc<ComputeBridge>,
    load_timeout: Duration,
    loaded: RwLock<Option<LoadedModel>>,
}

impl ModelManager {
    /// Wrap `bridge`; when `enabled`, a compute context is provisioned right away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(bridge: Arc<ComputeBridge>, enabled: bool, load_timeout: Duration) -> Self {
        let manager = Self {
            bridge,
            load_timeout,
            loaded: RwLock::new(None),
        };
        if enabled {
            manager.enable();
        }
        manager
    }

    pub fn bridge(&self) -> &Arc<ComputeBridge> {
        &self.bridge
    }

    /// Load the model. No-op while `loading` or `ready`.
    ///
    /// Failures land in the status (`error` plus message) rather than being
    /// returned; the resulting status is returned for convenience.
    pub async fn initialize(&self) -> LifecycleStatus {
        let started = self.bridge.update_status(|snapshot| match snapshot.status {
            LifecycleStatus::Idle | LifecycleStatus::Error => {
                snapshot.status = LifecycleStatus::Loading;
                snapshot.message = Some("Starting model load".to_string());
                snapshot.progress = None;
                true
            }
            LifecycleStatus::Loading | LifecycleStatus::Ready | LifecycleStatus::Disabled => false,
        });
        if !started {
            return self.status();
        }

        // an unexpected worker exit leaves no context behind
        if let Err(e) = self.bridge.provision() {
            self.fail(e.to_string());
            return self.status();
        }

        log::info!("initializing embedding model");
        match self.bridge.call(WorkerRequest::Init, self.load_timeout).await {
            Ok(WorkerReply::Loaded { model, dimensions }) => {
                log::info!("model '{}' ready ({} dims)", model, dimensions);
                *self.loaded.write().unwrap_or_else(PoisonError::into_inner) = Some(LoadedModel {
                    name: model.clone(),
                    dimensions,
                });
                self.bridge.update_status(|snapshot| {
                    if snapshot.status == LifecycleStatus::Disabled {
                        return false;
                    }
                    snapshot.status = LifecycleStatus::Ready;
                    snapshot.message = Some(format!("Model '{}' ready", model));
                    snapshot.progress = None;
                    true
                });
            }
            Ok(other) => self.fail(format!("unexpected reply to init: {:?}", other)),
            Err(e) => {
                log::error!("model initialization failed: {}", e);
                self.fail(e.to_string());
            }
        }

        self.status()
    }

    /// Turn the feature on or off.
    ///
    /// Disabling tears the compute context down synchronously; enabling
    /// provisions a fresh one and moves to `idle`.
    pub fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.enable();
        } else {
            self.bridge.teardown();
            *self.loaded.write().unwrap_or_else(PoisonError::into_inner) = None;
        }
    }

    fn enable(&self) {
        if self.status() != LifecycleStatus::Disabled {
            return;
        }
        if let Err(e) = self.bridge.provision() {
            log::error!("failed to provision compute context: {}", e);
            // `fail` leaves `disabled` alone, and the caller asked to leave it
            self.bridge.update_status(|snapshot| {
                snapshot.status = LifecycleStatus::Error;
                snapshot.message = Some(e.to_string());
                snapshot.progress = None;
                true
            });
        }
    }

    fn fail(&self, message: String) {
        self.bridge.update_status(|snapshot| {
            if snapshot.status == LifecycleStatus::Disabled {
                return false;
            }
            snapshot.status = LifecycleStatus::Error;
            snapshot.message = Some(message);
            snapshot.progress = None;
            true
        });
    }

    pub fn status(&self) -> LifecycleStatus {
        self.bridge.snapshot().status
    }

    pub fn status_message(&self) -> Option<String> {
        self.bridge.snapshot().message
    }

    pub fn progress(&self) -> Option<Progress> {
        self.bridge.snapshot().progress
    }

    pub fn is_ready(&self) -> bool {
        self.status() == LifecycleStatus::Ready
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.bridge.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.bridge.subscribe()
    }

    pub fn loaded_model(&self) -> Option<LoadedModel> {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
