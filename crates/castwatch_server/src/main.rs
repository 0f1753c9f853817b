#![forbid(unsafe_code)]

mod config;
mod monitor;
mod server;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use castwatch_platform::notify::{LogNotifier, TelegramNotifier};
use castwatch_platform::stripchat::StripchatClient;
use castwatch_platform::{Notifier, Store};
use castwatch_util::bind::parse_socket_addr;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::CollectorConfig;
use crate::monitor::orchestrator::Orchestrator;
use crate::server::health::{HealthState, spawn_health_server};
use crate::store::{MemoryStore, SqlStore};

struct Args {
	config: Option<PathBuf>,
	dry_run: bool,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: castwatch [--config path] [--dry-run]\n\
\n\
Options:\n\
\t--config   Config file (default: ~/.castwatch/config.toml)\n\
\t--dry-run  Keep everything in memory; no database writes\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Args {
	let mut args = Args {
		config: None,
		dry_run: false,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			"--dry-run" => args.dry_run = true,
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}
	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG")
		.unwrap_or_else(|_| "info,castwatch_server=debug,castwatch_platform=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("castwatch_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match parse_socket_addr(bind) {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn open_store(cfg: &CollectorConfig) -> anyhow::Result<Arc<dyn Store>> {
	match cfg.persistence.database_url.as_deref() {
		Some(url) if !cfg.dry_run => {
			let store = SqlStore::connect(url).await?;
			info!(backend = store.backend_name(), "database connected");
			Ok(Arc::new(store))
		}
		Some(_) => {
			info!("dry run; events stay in memory");
			Ok(Arc::new(MemoryStore::new()))
		}
		None => {
			warn!("no database_url configured; events stay in memory");
			Ok(Arc::new(MemoryStore::new()))
		}
	}
}

fn build_notifier(cfg: &CollectorConfig) -> Arc<dyn Notifier> {
	let (Some(token), Some(chat_id)) = (
		cfg.notify.telegram_bot_token.clone(),
		cfg.notify.telegram_chat_id.as_deref(),
	) else {
		info!("telegram not configured; notifications go to the log");
		return Arc::new(LogNotifier);
	};
	match TelegramNotifier::new(token, chat_id) {
		Ok(n) => Arc::new(n),
		Err(e) => {
			warn!(error = %e, "failed to build telegram notifier; falling back to the log");
			Arc::new(LogNotifier)
		}
	}
}

async fn wait_for_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};
		match signal(SignalKind::terminate()) {
			Ok(mut term) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => {}
					_ = term.recv() => {}
				}
				return;
			}
			Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
		}
	}
	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!(error = %e, "failed to listen for ctrl-c");
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();
	let config_path = match args.config {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let mut cfg = crate::config::load_config_from_path(&config_path)?;
	cfg.dry_run |= args.dry_run;
	info!(path = %config_path.display(), casts = cfg.casts.len(), "loaded config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match parse_socket_addr(bind) {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let store = open_store(&cfg).await?;
	let notifier = build_notifier(&cfg);
	let stripchat = Arc::new(StripchatClient::new(cfg.stripchat_config())?);

	let orchestrator = Orchestrator::new(
		cfg.orchestrator_config(),
		stripchat.clone(),
		stripchat,
		store,
		notifier,
		health_state,
	);

	let shutdown = CancellationToken::new();
	let trigger = shutdown.clone();
	tokio::spawn(async move {
		wait_for_signal().await;
		info!("shutdown requested");
		trigger.cancel();
	});

	orchestrator.run(shutdown).await
}
