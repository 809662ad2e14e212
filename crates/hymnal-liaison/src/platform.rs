//! Platform capabilities the liaison depends on.

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};

use crate::LiaisonError;

/// The page the liaison runs in.
pub trait PageHost: Send + Sync {
    /// User agent string.
    fn user_agent(&self) -> String;

    /// Whether background workers can be registered at all.
    fn supports_service_workers(&self) -> bool;

    /// Reload the page so it runs under the newest generation.
    fn reload(&self);
}

/// User's answer to the install prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallChoice {
    Accepted,
    Dismissed,
}

/// A deferred native install prompt.
#[async_trait]
pub trait InstallPrompt: Send + Sync {
    /// Suppress the platform's own prompt UI.
    fn prevent_default(&self);

    /// Show the prompt and wait for the user's choice.
    async fn prompt(&self) -> Result<InstallChoice, LiaisonError>;
}

/// Signals the platform raises on the page.
#[derive(Clone)]
pub enum PlatformEvent {
    /// The app became installable.
    BeforeInstallPrompt(Arc<dyn InstallPrompt>),
    /// The app was installed.
    AppInstalled,
}

impl fmt::Debug for PlatformEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformEvent::BeforeInstallPrompt(_) => f.write_str("BeforeInstallPrompt"),
            PlatformEvent::AppInstalled => f.write_str("AppInstalled"),
        }
    }
}

/// Coarse device class derived from the user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAgentClass {
    Desktop,
    Mobile,
    Ios,
}

fn ios_pattern() -> Option<&'static Regex> {
    static IOS: OnceLock<Option<Regex>> = OnceLock::new();
    IOS.get_or_init(|| Regex::new(r"iPad|iPhone|iPod").ok()).as_ref()
}

fn mobile_pattern() -> Option<&'static Regex> {
    static MOBILE: OnceLock<Option<Regex>> = OnceLock::new();
    MOBILE
        .get_or_init(|| {
            RegexBuilder::new(r"android|webos|iphone|ipad|ipod|blackberry|iemobile|opera mini|mobile")
                .case_insensitive(true)
                .build()
                .ok()
        })
        .as_ref()
}

impl UserAgentClass {
    pub fn classify(user_agent: &str) -> Self {
        let matches = |re: Option<&Regex>| re.is_some_and(|re| re.is_match(user_agent));
        if matches(ios_pattern()) {
            UserAgentClass::Ios
        } else if matches(mobile_pattern()) {
            UserAgentClass::Mobile
        } else {
            UserAgentClass::Desktop
        }
    }

    pub fn is_mobile(&self) -> bool {
        !matches!(self, UserAgentClass::Desktop)
    }
}
