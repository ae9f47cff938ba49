#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parley_protocol::QuicEndpoint;
use parley_server::config::{ServerConfig, default_config_path, load_server_config_from_path};
use parley_server::quic::config::QuicServerConfig;
use parley_server::server::auth::HmacIdentityProvider;
use parley_server::server::gateway::Gateway;
use parley_server::server::health::{HealthState, spawn_health_server};
use parley_server::server::listener::run_accept_loop;
use parley_server::server::log::DeliveryLog;
use parley_server::server::registry::ConversationRegistry;
use parley_server::server::session::SessionSettings;
use parley_server::storage::{Database, SqlLogBackend, SqlRegistryBackend, spawn_storage_probe};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const STORAGE_PROBE_INTERVAL: Duration = Duration::from_secs(10);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind quic://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: quic://127.0.0.1:18300)\n\
\t           Host must be an IP literal\n\
\t--config   Config file (default: ~/.parley/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: SocketAddr,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut bind_endpoint = "quic://127.0.0.1:18300".to_string();
	let mut config = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				bind_endpoint = it.next().unwrap_or_else(|| usage_and_exit());
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = QuicEndpoint::parse(&bind_endpoint)
		.and_then(|e| e.socket_addr())
		.unwrap_or_else(|e| {
			eprintln!("{e}");
			usage_and_exit();
		});

	Args { bind, config }
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	let Some(endpoint) = otlp_endpoint else {
		base.init();
		return;
	};

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
			let tracer = tracer_provider.tracer("parley_server");
			global::set_tracer_provider(tracer_provider);

			base.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
			info!(endpoint = %endpoint, "otlp tracing enabled");
		}
		Err(e) => {
			base.init();
			warn!(error = %e, "failed to initialize otlp tracing");
		}
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
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
		Err(e) => warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)"),
	}
}

/// Delivery log and registry, SQL-backed when persistence is enabled.
async fn open_storage(cfg: &ServerConfig, health: &HealthState) -> anyhow::Result<(DeliveryLog, ConversationRegistry)> {
	let log_cfg = cfg.gateway.log_config(cfg.persistence.hot_capacity);

	if !cfg.persistence.enabled {
		info!("persistence disabled; conversations and messages live in memory");
		return Ok((DeliveryLog::in_memory(log_cfg), ConversationRegistry::in_memory()));
	}

	let Some(database_url) = cfg.persistence.database_url.as_deref() else {
		return Err(anyhow!("persistence enabled but no database_url configured"));
	};
	let db = Database::connect(database_url, cfg.persistence.max_connections).await?;

	let log = DeliveryLog::new(Arc::new(SqlLogBackend::new(db.clone())), log_cfg);
	let registry = ConversationRegistry::hydrate(Arc::new(SqlRegistryBackend::new(db.clone()))).await?;

	spawn_storage_probe(db, health.clone(), STORAGE_PROBE_INTERVAL);
	Ok((log, registry))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => default_config_path()?,
	};
	let server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let Some(secret) = server_cfg.server.auth_hmac_secret.clone() else {
		return Err(anyhow!(
			"no auth_hmac_secret configured (set [server].auth_hmac_secret or PARLEY_AUTH_HMAC_SECRET)"
		));
	};

	let quic_cfg = QuicServerConfig::new(args.bind);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %args.bind,
			cert_der_len = server_cert_der.len(),
			"parley_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	let (log, registry) = open_storage(&server_cfg, &health_state).await?;

	let gateway = Gateway::new(
		server_cfg.gateway.gateway_config(),
		Arc::new(HmacIdentityProvider::new(secret)),
		registry,
		log,
	);
	let _reaper = gateway.spawn_idle_reaper();

	let settings = SessionSettings {
		server_name: server_cfg.server.server_name.clone(),
		..SessionSettings::default()
	};

	health_state.mark_ready();
	info!(bind = %args.bind, "parley_server: accepting connections");

	run_accept_loop(endpoint, gateway, settings).await;
	Ok(())
}
