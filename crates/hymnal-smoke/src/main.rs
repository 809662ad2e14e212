//! Hymnal Smoke Harness
//!
//! Registers the offline cache supervisor against a live origin, fetches a
//! list of paths through it (optionally a second time with connectivity
//! switched off), and prints a JSON summary of where every response came
//! from.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use hymnal_common::{init_logging, LogConfig, LogFormat};
use hymnal_liaison::{ClientLiaison, LiaisonConfig, LogNotifier, PageHost};
use hymnal_net::{Connectivity, HttpFetcher, LoaderConfig, Request, ResponseSource, Url};
use hymnal_sw::{CacheStorage, ServiceWorkerContainer, ServiceWorkerEvent};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Operation durations, summarized per pass.
struct PerfTiming {
    timings: HashMap<&'static str, Vec<Duration>>,
}

impl PerfTiming {
    fn new() -> Self {
        Self {
            timings: HashMap::new(),
        }
    }

    fn record(&mut self, operation: &'static str, duration: Duration) {
        self.timings.entry(operation).or_default().push(duration);
    }

    fn summary(&self) -> serde_json::Value {
        let mut summary = serde_json::Map::new();

        for (op, durations) in &self.timings {
            if durations.is_empty() {
                continue;
            }

            let millis: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
            let count = millis.len();
            let total_ms: f64 = millis.iter().sum();
            let max_ms = millis.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            summary.insert(
                op.to_string(),
                json!({
                    "count": count,
                    "total_ms": round2(total_ms),
                    "avg_ms": round2(total_ms / count as f64),
                    "max_ms": round2(max_ms),
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parse command line arguments
struct Args {
    origin: String,
    config: Option<PathBuf>,
    storage: Option<PathBuf>,
    offline: bool,
    log_format: LogFormat,
    output: Option<PathBuf>,
    paths: Vec<String>,
}

impl Args {
    fn parse() -> anyhow::Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            origin: "http://localhost:5173/".to_string(),
            config: None,
            storage: None,
            offline: false,
            log_format: LogFormat::Compact,
            output: None,
            paths: Vec::new(),
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--origin" => {
                    parsed.origin = args.next().context("--origin needs a URL")?;
                }
                "--config" => {
                    parsed.config = args.next().map(PathBuf::from);
                }
                "--storage" => {
                    parsed.storage = args.next().map(PathBuf::from);
                }
                "--offline" => {
                    parsed.offline = true;
                }
                "--log-format" => {
                    let value = args.next().context("--log-format needs a value")?;
                    parsed.log_format = value.parse().map_err(anyhow::Error::msg)?;
                }
                "--output" => {
                    parsed.output = args.next().map(PathBuf::from);
                }
                flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
                path => parsed.paths.push(path.to_string()),
            }
        }

        if parsed.paths.is_empty() {
            parsed.paths = vec![
                "/".to_string(),
                "/static/hymns.json".to_string(),
                "/manifest.json".to_string(),
            ];
        }
        Ok(parsed)
    }
}

struct SmokeHost;

impl PageHost for SmokeHost {
    fn user_agent(&self) -> String {
        format!("hymnal-smoke/{}", env!("CARGO_PKG_VERSION"))
    }

    fn supports_service_workers(&self) -> bool {
        true
    }

    fn reload(&self) {
        info!("Page reload requested");
    }
}

/// Paths without an extension, or ending in `.html`, are page navigations.
fn is_document(path: &str) -> bool {
    let last = path.rsplit('/').next().unwrap_or_default();
    last.is_empty() || last.ends_with(".html") || !last.contains('.')
}

async fn drain(
    liaison: &ClientLiaison,
    events: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>,
) {
    while let Ok(event) = events.try_recv() {
        liaison.handle_worker_event(event).await;
    }
}

async fn fetch_pass(
    pass: &'static str,
    origin: &Url,
    paths: &[String],
    container: &ServiceWorkerContainer,
    perf: &mut PerfTiming,
) -> Vec<serde_json::Value> {
    let mut rows = Vec::with_capacity(paths.len());
    for path in paths {
        let url = match origin.join(path) {
            Ok(url) => url,
            Err(e) => {
                warn!(path = %path, error = %e, "Skipping unparseable path");
                continue;
            }
        };
        let request = if is_document(path) {
            Request::navigate(url)
        } else {
            Request::get(url)
        };

        let started = Instant::now();
        let row = match container.fetch(&request).await {
            Ok(response) => {
                let source = match response.source {
                    ResponseSource::Network => "network",
                    ResponseSource::Cache => "cache",
                    ResponseSource::Synthetic => "synthetic",
                };
                json!({
                    "pass": pass,
                    "path": path,
                    "status": response.status.as_u16(),
                    "source": source,
                    "bytes": response.body.len(),
                })
            }
            Err(e) => {
                error!(path = %path, error = %e, "Fetch failed");
                json!({ "pass": pass, "path": path, "error": e.to_string() })
            }
        };
        perf.record(pass, started.elapsed());
        rows.push(row);
    }
    rows
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse()?;
    init_logging(LogConfig::default().with_format(args.log_format))?;

    let origin = Url::parse(&args.origin).with_context(|| format!("invalid origin {}", args.origin))?;
    let config = match &args.config {
        Some(path) => LiaisonConfig::from_json_file(path)?,
        None => LiaisonConfig::default(),
    };
    let storage = match &args.storage {
        Some(path) => CacheStorage::restore(path).await?,
        None => CacheStorage::new(),
    };

    info!(origin = %origin, paths = args.paths.len(), offline = args.offline, "Smoke run starting");

    let fetcher = Arc::new(HttpFetcher::new(LoaderConfig::default())?);
    let connectivity = Connectivity::new(true);
    let (container, mut events) =
        ServiceWorkerContainer::new(origin.clone(), fetcher, connectivity.clone());
    let container = Arc::new(container.with_storage(Arc::new(storage)));
    let liaison = ClientLiaison::new(
        config,
        Arc::clone(&container),
        Arc::new(SmokeHost),
        Arc::new(LogNotifier),
    );

    let mut perf = PerfTiming::new();
    let started = Instant::now();
    let registration = liaison.mount().await;
    perf.record("register", started.elapsed());
    drain(&liaison, &mut events).await;
    if registration.is_none() {
        warn!("Running without a service worker");
    }

    let mut results = fetch_pass("online", &origin, &args.paths, &container, &mut perf).await;
    if let Some(worker) = container.controller().await {
        worker.supervisor().wait_until_idle().await;
    }

    if args.offline {
        connectivity.set_online(false);
        liaison.handle_connectivity(false).await;
        results.extend(fetch_pass("offline", &origin, &args.paths, &container, &mut perf).await);
    }

    if let Some(path) = &args.storage {
        container.caches().persist(path).await?;
    }

    let state = liaison.state().await;
    let summary = json!({
        "origin": origin.as_str(),
        "registered": state.registered,
        "offline": state.offline,
        "update_available": state.update_available,
        "caches": container.caches().keys().await,
        "results": results,
        "timing": perf.summary(),
    });

    match &args.output {
        Some(path) => {
            std::fs::write(path, serde_json::to_string_pretty(&summary)?)
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "Summary written");
        }
        None => println!("{}", serde_json::to_string_pretty(&summary)?),
    }

    let failures = results.iter().filter(|row| row.get("error").is_some()).count();
    if failures > 0 {
        bail!("{failures} fetches failed");
    }
    Ok(())
}
