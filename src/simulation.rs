#![cfg(feature = "simulation")]
//! Load simulation: several tabs of the tournament app share one backend, one persistent store and one cross-tab hub.
//!
//! Every tab reads tournaments through its own request optimizer while the backend streams match score updates. At
//! the end a table with the per-tab telemetry is printed.

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use comfy_table::CellAlignment;
use fieldx::fxstruct;
use garde::Validate;
use rand::Rng;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::cache::CacheConfig;
use crate::error::FetchError;
use crate::keys;
use crate::optimizer::{OptimizerConfig, RequestOptions};
use crate::realtime::{LocalBroadcast, SubscriptionSpec};
use crate::services::{Capabilities, Services, ServicesConfig};
use crate::storage::{FileStore, MokaStore};
use crate::telemetry::PerformanceReport;
use crate::test::MockSource;
use crate::traits::PersistentStore;
use crate::types::{ChangePayload, MetricCategory, Priority};

const MATCH_TABLE: &str = "match";

#[derive(Debug, Clone, clap::Parser, Validate)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, author, name = "tourney")]
pub struct Cli {
    /// Number of simulated browser tabs.
    #[clap(long, env = "BEYCACHE_TABS", default_value_t = 3)]
    #[garde(range(min = 1, max = 64))]
    tabs: usize,

    /// Tournaments known to the backend.
    #[clap(long, env = "BEYCACHE_TOURNAMENTS", default_value_t = 20)]
    #[garde(range(min = 1))]
    tournaments: u32,

    /// Tournament reads per tab.
    #[clap(long, env = "BEYCACHE_READS", default_value_t = 300)]
    #[garde(range(min = 1))]
    reads: usize,

    /// Match score updates streamed by the backend.
    #[clap(long, env = "BEYCACHE_UPDATES", default_value_t = 60)]
    #[garde(skip)]
    updates: usize,

    /// Simulated backend latency in milliseconds.
    #[clap(long, env = "BEYCACHE_LATENCY_MS", default_value_t = 25)]
    #[garde(skip)]
    latency_ms: u64,

    /// Share of backend fetches failing with a transient error.
    #[clap(long, env = "BEYCACHE_FAILURE_RATE", default_value_t = 0.05)]
    #[garde(range(min = 0.0, max = 1.0))]
    failure_rate: f64,

    /// Concurrency bound of each tab's optimizer.
    #[clap(long, env = "BEYCACHE_MAX_CONCURRENT", default_value_t = 5)]
    #[garde(range(min = 1))]
    max_concurrent: usize,

    /// Seconds a fetched tournament stays cached.
    #[clap(long, env = "BEYCACHE_CACHE_TIME", default_value_t = 5)]
    #[garde(skip)]
    cache_time: u64,

    /// Keep the persistent tier in this directory instead of in memory.
    #[clap(long, env = "BEYCACHE_CACHE_DIR")]
    #[fieldx(get(clone))]
    #[garde(skip)]
    cache_dir: Option<PathBuf>,

    /// Silence the output.
    #[clap(long, short, env = "BEYCACHE_QUIET", default_value_t = false)]
    #[garde(skip)]
    quiet: bool,
}

#[derive(Debug)]
struct TabOutcome {
    tab:        String,
    elapsed:    Duration,
    reads:      usize,
    failures:   usize,
    deliveries: u64,
    report:     PerformanceReport,
}

/// The simulation application.
pub struct TourneyApp {
    cli:           Cli,
    backend:       Arc<MockSource>,
    backend_calls: Arc<AtomicUsize>,
    store:         Arc<dyn PersistentStore>,
    hub:           LocalBroadcast,
}

impl TourneyApp {
    pub fn new(cli: Cli) -> anyhow::Result<Self> {
        if let Err(err) = cli.validate() {
            let mut cmd = Cli::command();
            cmd.error(ErrorKind::InvalidValue, err).exit();
        }

        let store: Arc<dyn PersistentStore> = match cli.cache_dir() {
            Some(dir) => Arc::new(FileStore::open(&dir).with_context(|| format!("opening {}", dir.display()))?),
            None => Arc::new(MokaStore::default()),
        };

        let matches = (0..cli.tournaments)
            .map(|id| json!({"id": id, "tournament_id": id, "score": [0, 0]}))
            .collect();

        Ok(Self {
            backend: Arc::new(MockSource::new().with_rows(MATCH_TABLE, matches)),
            backend_calls: Arc::new(AtomicUsize::new(0)),
            store,
            hub: LocalBroadcast::default(),
            cli,
        })
    }

    /// Parse the command line, install logging and run the simulation.
    pub async fn run() -> anyhow::Result<()> {
        setup_tracing()?;
        let app = Self::new(Cli::parse())?;
        app.execute().await
    }

    pub async fn execute(&self) -> anyhow::Result<()> {
        let started = Instant::now();
        let mut tabs = JoinSet::new();

        for n in 0..self.cli.tabs {
            let services = Services::<Value>::create(self.services_config(n)?, self.capabilities())?;
            let tab = TabRun {
                name: format!("tab-{n}"),
                services,
                cli: self.cli.clone(),
                backend_calls: self.backend_calls.clone(),
            };
            tabs.spawn(tab.run());
        }

        let streamer = tokio::spawn(stream_updates(
            self.backend.clone(),
            self.cli.updates,
            self.cli.tournaments,
        ));

        let mut outcomes = Vec::with_capacity(self.cli.tabs);
        while let Some(joined) = tabs.join_next().await {
            outcomes.push(joined.context("tab task failed")??);
        }
        streamer.abort();
        outcomes.sort_by(|a, b| a.tab.cmp(&b.tab));

        if !self.cli.quiet {
            println!("{}", self.summary(&outcomes, started.elapsed()));
        }
        Ok(())
    }

    fn services_config(&self, n: usize) -> anyhow::Result<ServicesConfig> {
        Ok(ServicesConfig {
            cache: CacheConfig::builder()
                .name(format!("tab-{n}"))
                .storage_prefix(format!("tourney:{n}:"))
                .build()?,
            optimizer: OptimizerConfig::builder()
                .name(format!("tab-{n}"))
                .max_concurrent_requests(self.cli.max_concurrent)
                .build()?,
            ..Default::default()
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new(self.backend.clone())
            .with_store(self.store.clone())
            .with_broadcast(Arc::new(self.hub.clone()))
    }

    fn summary(&self, outcomes: &[TabOutcome], elapsed: Duration) -> String {
        let mut table = comfy_table::Table::new();
        table
            .load_preset(comfy_table::presets::ASCII_FULL_CONDENSED)
            .set_header([
                "Tab",
                "Reads",
                "Failed",
                "Hit rate",
                "Avg API (ms)",
                "Deliveries",
                "Time (s)",
            ]);

        for outcome in outcomes {
            let summary = &outcome.report.summary;
            table.add_row([
                outcome.tab.clone(),
                outcome.reads.to_string(),
                outcome.failures.to_string(),
                format!("{:.1}%", summary.cache_hit_rate * 100.0),
                summary
                    .average_api_latency_ms
                    .map_or_else(|| "-".to_string(), |ms| format!("{ms:.1}")),
                outcome.deliveries.to_string(),
                format!("{:.2}", outcome.elapsed.as_secs_f64()),
            ]);
        }

        for col in 1..=6 {
            if let Some(column) = table.column_mut(col) {
                column.set_cell_alignment(CellAlignment::Right);
            }
        }

        format!(
            "*** {} ***\nBackend fetches: {} for {} reads in {:.2}s\n{}",
            chrono::Local::now().naive_local(),
            self.backend_calls.load(Ordering::Relaxed),
            outcomes.iter().map(|o| o.reads).sum::<usize>(),
            elapsed.as_secs_f64(),
            table
        )
    }
}

struct TabRun {
    name:          String,
    services:      Services<Value>,
    cli:           Cli,
    backend_calls: Arc<AtomicUsize>,
}

impl TabRun {
    async fn run(self) -> anyhow::Result<TabOutcome> {
        let started = Instant::now();
        let subscription = self
            .services
            .realtime()
            .subscribe(SubscriptionSpec::new(MATCH_TABLE))?;

        let options = RequestOptions::builder()
            .retries(3)
            .retry_delay(Duration::from_millis(20))
            .timeout(Duration::from_millis(self.cli.latency_ms * 10 + 100))
            .cache_time(Duration::from_secs(self.cli.cache_time))
            .build()?;
        let urgent = RequestOptions::builder()
            .priority(Priority::High)
            .retries(3)
            .retry_delay(Duration::from_millis(20))
            .build()?;

        let mut failures = 0;
        for read in 0..self.cli.reads {
            let id = rand::rng().random_range(0..self.cli.tournaments);
            let key = keys::tournament(id);
            // Every tenth read is the page the user is looking at.
            let options = if read % 10 == 0 { &urgent } else { &options };
            let fetch = backend_fetch(id, &self.cli, self.backend_calls.clone());

            let result = self
                .services
                .telemetry()
                .measure("tournament_page", MetricCategory::Render, async {
                    self.services.optimizer().request(&key, options, fetch).await
                })
                .await;
            if let Err(err) = result {
                debug!(tab = %self.name, %key, %err, "read failed");
                failures += 1;
            }
        }

        // Let trailing deliveries through.
        tokio::time::sleep(self.services.realtime().config().throttle() * 2).await;
        let deliveries = subscription.snapshot().deliveries;
        let report = self.services.telemetry().generate_report();
        info!(tab = %self.name, failures, deliveries, "tab finished");

        drop(subscription);
        self.services.destroy();

        Ok(TabOutcome {
            tab: self.name,
            elapsed: started.elapsed(),
            reads: self.cli.reads,
            failures,
            deliveries,
            report,
        })
    }
}

fn backend_fetch(
    id: u32,
    cli: &Cli,
    calls: Arc<AtomicUsize>,
) -> impl Fn() -> crate::optimizer::FetchFuture<Value> + Send + Sync + 'static {
    let latency = Duration::from_millis(cli.latency_ms);
    let failure_rate = cli.failure_rate;
    move || {
        calls.fetch_add(1, Ordering::Relaxed);
        let jitter = rand::rng().random_range(0..=latency.as_millis() as u64 / 2 + 1);
        let fails = rand::rng().random_bool(failure_rate);
        Box::pin(async move {
            tokio::time::sleep(latency + Duration::from_millis(jitter)).await;
            if fails {
                Err(FetchError::from_status(503, "backend overloaded"))
            }
            else {
                Ok(json!({"id": id, "name": format!("Cup #{id}"), "stage": "swiss"}))
            }
        })
    }
}

async fn stream_updates(backend: Arc<MockSource>, updates: usize, tournaments: u32) {
    for n in 0..updates {
        let (id, a, b, pause) = {
            let mut rng = rand::rng();
            (
                rng.random_range(0..tournaments),
                rng.random_range(0..4u32),
                rng.random_range(0..4u32),
                rng.random_range(5..50u64),
            )
        };
        let payload = ChangePayload::update(
            MATCH_TABLE,
            json!({"id": id}),
            json!({"id": id, "tournament_id": id, "score": [a, b]}),
        )
        .with_id(format!("evt-{n}"));
        backend.emit(payload);
        tokio::time::sleep(Duration::from_millis(pause)).await;
    }
}

fn setup_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    info!("Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_run() {
        let cli = Cli::try_parse_from([
            "tourney",
            "--tabs",
            "2",
            "--tournaments",
            "4",
            "--reads",
            "20",
            "--updates",
            "5",
            "--latency-ms",
            "1",
            "--failure-rate",
            "0",
            "--quiet",
        ])
        .unwrap();
        let app = TourneyApp::new(cli).unwrap();
        app.execute().await.unwrap();

        // Four tournaments, two tabs: the optimizer cache keeps fetches well below the read count.
        assert!(app.backend_calls.load(Ordering::Relaxed) <= 8);
    }
}
