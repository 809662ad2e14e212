//! # Hymnal Service Worker
//!
//! Offline cache supervisor for the hymnal app, plus the host-side container
//! that registers it and routes page fetches through it.
//!
//! ## Features
//!
//! - **Lifecycle**: install (pre-warm critical assets), activate (claim
//!   clients, drop stale generations), skip-waiting
//! - **Cache API**: named caches keyed by method + URL, LRU cap on the
//!   dynamic cache, JSON snapshots
//! - **Fetch Interception**: network-first, cache-first and
//!   stale-while-revalidate, picked per request by URL pattern
//! - **Messaging**: `SKIP_WAITING` in, `SW_INSTALLED` broadcast out
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (page side)
//!     │
//!     └── ServiceWorkerRegistration
//!             ├── installing (ServiceWorker)
//!             ├── waiting (ServiceWorker)
//!             └── active (ServiceWorker) ── CacheSupervisor
//!                                              ├── RequestClassifier
//!                                              ├── Fetcher (network)
//!                                              └── CacheStorage (shared)
//!                                                     └── Cache
//!                                                           └── Request → Response
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use hymnal_common::HymnalError;
use hymnal_net::NetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod classify;
pub mod config;
pub mod container;
pub mod messages;
mod strategy;
pub mod supervisor;

pub use cache::{Cache, CacheEntry, CacheStorage, CachedHeader};
pub use classify::{RequestClass, RequestClassifier, Strategy};
pub use config::{FetchDeadlines, SupervisorConfig};
pub use container::{
    RegistrationOptions, ServiceWorker, ServiceWorkerContainer, ServiceWorkerEvent,
    ServiceWorkerRegistration,
};
pub use messages::{ClientChannel, ClientMessage, WorkerMessage};
pub use supervisor::{ActivateReport, CacheSupervisor, InstallReport, SupervisorBuilder};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] NetError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Config error: {0}")]
    ConfigError(#[from] HymnalError),

    #[error("Snapshot error: {0}")]
    SnapshotError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Initial state, not yet installing.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or unregistered).
    Redundant,
}

impl ServiceWorkerState {
    /// Whether fetch events may be served from caches.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, ServiceWorkerState::Activated)
    }
}

impl std::fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}
