#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

use crate::server::gateway::GatewayConfig;
use crate::server::log::LogConfig;
use crate::util::secret::SecretString;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and `PARLEY_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub gateway: GatewaySettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Name announced in `Welcome`.
	pub server_name: String,
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret shared with the identity service.
	pub auth_hmac_secret: Option<SecretString>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			server_name: "parley".to_string(),
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
	pub max_content_code_points: usize,
	pub idempotency_window: Duration,
	pub auth_timeout: Duration,
	pub idle_timeout: Duration,
	pub reaper_interval: Duration,
	pub outbound_queue_capacity: usize,
	pub catch_up_page_size: usize,
}

impl Default for GatewaySettings {
	fn default() -> Self {
		let gateway = GatewayConfig::default();
		let log = LogConfig::default();
		Self {
			max_content_code_points: gateway.max_content_code_points,
			idempotency_window: log.idempotency_window,
			auth_timeout: gateway.auth_timeout,
			idle_timeout: gateway.idle_timeout,
			reaper_interval: gateway.reaper_interval,
			outbound_queue_capacity: gateway.outbound_queue_capacity,
			catch_up_page_size: log.page_size,
		}
	}
}

impl GatewaySettings {
	pub fn gateway_config(&self) -> GatewayConfig {
		GatewayConfig {
			max_content_code_points: self.max_content_code_points,
			auth_timeout: self.auth_timeout,
			idle_timeout: self.idle_timeout,
			reaper_interval: self.reaper_interval,
			outbound_queue_capacity: self.outbound_queue_capacity,
			debug_logs: false,
		}
	}

	pub fn log_config(&self, hot_capacity: Option<usize>) -> LogConfig {
		LogConfig {
			page_size: self.catch_up_page_size,
			hot_capacity,
			idempotency_window: self.idempotency_window,
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
	/// Per-conversation retention; older messages are compacted away.
	pub hot_capacity: Option<usize>,
	pub max_connections: u32,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			enabled: false,
			database_url: None,
			hot_capacity: None,
			max_connections: 8,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,
	#[serde(default)]
	gateway: FileGatewaySettings,
	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	server_name: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileGatewaySettings {
	max_content_code_points: Option<usize>,
	idempotency_window_secs: Option<u64>,
	auth_timeout_ms: Option<u64>,
	idle_timeout_secs: Option<u64>,
	reaper_interval_ms: Option<u64>,
	outbound_queue_capacity: Option<usize>,
	catch_up_page_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
	hot_capacity: Option<usize>,
	max_connections: Option<u32>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = GatewaySettings::default();
		let g = file.gateway;

		Self {
			server: ServerSettings {
				server_name: non_blank(file.server.server_name).unwrap_or_else(|| "parley".to_string()),
				tls_cert_path: non_blank(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_blank(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_blank(file.server.metrics_bind),
				health_bind: non_blank(file.server.health_bind),
				auth_hmac_secret: non_blank(file.server.auth_hmac_secret).map(SecretString::new),
			},
			gateway: GatewaySettings {
				max_content_code_points: g
					.max_content_code_points
					.filter(|v| *v > 0)
					.unwrap_or(defaults.max_content_code_points),
				idempotency_window: g
					.idempotency_window_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.idempotency_window),
				auth_timeout: g
					.auth_timeout_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(defaults.auth_timeout),
				idle_timeout: g
					.idle_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.idle_timeout),
				reaper_interval: g
					.reaper_interval_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(defaults.reaper_interval),
				outbound_queue_capacity: g
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.outbound_queue_capacity),
				catch_up_page_size: g
					.catch_up_page_size
					.filter(|v| *v > 0)
					.unwrap_or(defaults.catch_up_page_size),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_blank(file.persistence.database_url),
				hot_capacity: file.persistence.hot_capacity.filter(|v| *v > 0),
				max_connections: file
					.persistence
					.max_connections
					.filter(|v| *v > 0)
					.unwrap_or(PersistenceSettings::default().max_connections),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn env_string(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
	non_blank(lookup(key))
}

/// Positive numeric override; zero and garbage are ignored.
fn env_positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
	T: FromStr + PartialOrd + Default,
{
	env_string(lookup, key)
		.and_then(|v| v.parse::<T>().ok())
		.filter(|v| *v > T::default())
}

fn apply_env_overrides(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	if let Some(v) = env_string(&lookup, "PARLEY_SERVER_NAME") {
		cfg.server.server_name = v;
		info!("server config: server_name overridden by env");
	}
	if let Some(v) = env_string(&lookup, "PARLEY_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}
	if let Some(v) = env_string(&lookup, "PARLEY_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}
	if let Some(v) = env_string(&lookup, "PARLEY_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}
	if let Some(v) = env_string(&lookup, "PARLEY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}
	if let Some(v) = env_string(&lookup, "PARLEY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(max) = env_positive::<usize>(&lookup, "PARLEY_MAX_CONTENT_CODE_POINTS") {
		cfg.gateway.max_content_code_points = max;
		info!(max, "gateway config: max_content_code_points overridden by env");
	}
	if let Some(secs) = env_positive::<u64>(&lookup, "PARLEY_IDEMPOTENCY_WINDOW_SECS") {
		cfg.gateway.idempotency_window = Duration::from_secs(secs);
		info!(secs, "gateway config: idempotency_window overridden by env");
	}
	if let Some(ms) = env_positive::<u64>(&lookup, "PARLEY_AUTH_TIMEOUT_MS") {
		cfg.gateway.auth_timeout = Duration::from_millis(ms);
		info!(ms, "gateway config: auth_timeout overridden by env");
	}
	if let Some(secs) = env_positive::<u64>(&lookup, "PARLEY_IDLE_TIMEOUT_SECS") {
		cfg.gateway.idle_timeout = Duration::from_secs(secs);
		info!(secs, "gateway config: idle_timeout overridden by env");
	}
	if let Some(ms) = env_positive::<u64>(&lookup, "PARLEY_REAPER_INTERVAL_MS") {
		cfg.gateway.reaper_interval = Duration::from_millis(ms);
		info!(ms, "gateway config: reaper_interval overridden by env");
	}
	if let Some(capacity) = env_positive::<usize>(&lookup, "PARLEY_OUTBOUND_QUEUE_CAPACITY") {
		cfg.gateway.outbound_queue_capacity = capacity;
		info!(capacity, "gateway config: outbound_queue_capacity overridden by env");
	}
	if let Some(size) = env_positive::<usize>(&lookup, "PARLEY_CATCH_UP_PAGE_SIZE") {
		cfg.gateway.catch_up_page_size = size;
		info!(size, "gateway config: catch_up_page_size overridden by env");
	}

	if let Some(enabled) = lookup("PARLEY_PERSISTENCE_ENABLED").as_deref().and_then(parse_env_bool) {
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}
	if let Some(v) = env_string(&lookup, "PARLEY_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}
	if let Some(capacity) = env_positive::<usize>(&lookup, "PARLEY_HOT_CAPACITY") {
		cfg.persistence.hot_capacity = Some(capacity);
		info!(capacity, "persistence: hot_capacity overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn from_toml(s: &str) -> ServerConfig {
		ServerConfig::from_file(toml::from_str(s).expect("valid toml"))
	}

	#[test]
	fn empty_file_gives_defaults() {
		let cfg = from_toml("");
		assert_eq!(cfg.server.server_name, "parley");
		assert!(cfg.server.auth_hmac_secret.is_none());
		assert_eq!(cfg.gateway.max_content_code_points, parley_domain::DEFAULT_MAX_CONTENT_CODE_POINTS);
		assert_eq!(cfg.gateway.idle_timeout, Duration::from_secs(60));
		assert!(!cfg.persistence.enabled);
		assert_eq!(cfg.persistence.max_connections, 8);
	}

	#[test]
	fn file_sections_are_read_and_blanks_dropped() {
		let cfg = from_toml(
			r#"
[server]
server_name = "  "
metrics_bind = "127.0.0.1:9100"
auth_hmac_secret = "s3cret"

[gateway]
max_content_code_points = 280
idle_timeout_secs = 0
outbound_queue_capacity = 32

[persistence]
enabled = true
database_url = "sqlite:parley.db"
hot_capacity = 1000
"#,
		);
		assert_eq!(cfg.server.server_name, "parley");
		assert_eq!(cfg.server.metrics_bind.as_deref(), Some("127.0.0.1:9100"));
		assert_eq!(cfg.server.auth_hmac_secret.as_ref().map(|s| s.expose()), Some("s3cret"));
		assert_eq!(cfg.gateway.max_content_code_points, 280);
		assert_eq!(cfg.gateway.idle_timeout, Duration::from_secs(60), "zero falls back to default");
		assert_eq!(cfg.gateway.outbound_queue_capacity, 32);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.persistence.hot_capacity, Some(1000));

		let log = cfg.gateway.log_config(cfg.persistence.hot_capacity);
		assert_eq!(log.hot_capacity, Some(1000));
		assert_eq!(cfg.gateway.gateway_config().max_content_code_points, 280);
	}

	#[test]
	fn env_overrides_win_and_garbage_is_ignored() {
		let mut cfg = from_toml("[gateway]\nmax_content_code_points = 280\n");
		let env: HashMap<&str, &str> = HashMap::from([
			("PARLEY_MAX_CONTENT_CODE_POINTS", "500"),
			("PARLEY_AUTH_TIMEOUT_MS", "not-a-number"),
			("PARLEY_OUTBOUND_QUEUE_CAPACITY", "0"),
			("PARLEY_PERSISTENCE_ENABLED", "yes"),
			("PARLEY_DATABASE_URL", " postgres://db/parley "),
			("PARLEY_AUTH_HMAC_SECRET", "from-env"),
		]);
		apply_env_overrides(&mut cfg, |key| env.get(key).map(|v| v.to_string()));

		assert_eq!(cfg.gateway.max_content_code_points, 500);
		assert_eq!(cfg.gateway.auth_timeout, Duration::from_secs(5));
		assert_eq!(cfg.gateway.outbound_queue_capacity, 1024);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("postgres://db/parley"));
		assert_eq!(cfg.server.auth_hmac_secret.as_ref().map(|s| s.expose()), Some("from-env"));
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let path = std::env::temp_dir().join("parley-config-that-does-not-exist.toml");
		assert!(read_toml_if_exists(&path).unwrap().is_none());
	}
}
