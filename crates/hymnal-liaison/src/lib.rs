//! # Hymnal Liaison
//!
//! The page-side half of the offline stack. It registers the cache
//! supervisor, turns lifecycle and connectivity changes into user-facing
//! notifications, and exposes the two imperative actions the UI needs:
//! [`ClientLiaison::install_app`] and [`ClientLiaison::update_app`].
//!
//! Platform capabilities (the user agent, reloading the page, the native
//! install prompt, showing notifications) are reached through the
//! [`PageHost`], [`InstallPrompt`] and [`Notifier`] traits.

use hymnal_sw::ServiceWorkerError;
use thiserror::Error;

pub mod config;
pub mod liaison;
pub mod notify;
pub mod platform;

pub use config::{LiaisonConfig, LiaisonTexts};
pub use liaison::{ClientLiaison, LiaisonState};
pub use notify::{
    LogNotifier, Notification, NotificationAction, NotificationId, NotificationKind,
    NotificationLifetime, Notifier,
};
pub use platform::{InstallChoice, InstallPrompt, PageHost, PlatformEvent, UserAgentClass};

/// Errors surfaced by liaison actions.
#[derive(Error, Debug)]
pub enum LiaisonError {
    #[error("Service worker error: {0}")]
    ServiceWorker(#[from] ServiceWorkerError),

    #[error("Install prompt failed: {0}")]
    Prompt(String),

    #[error("Config error: {0}")]
    Config(#[from] hymnal_common::HymnalError),
}
