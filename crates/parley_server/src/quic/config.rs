#![forbid(unsafe_code)]

use std::fs;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use quinn::{Endpoint, IdleTimeout, ServerConfig, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};

/// QUIC listener settings.
#[derive(Debug, Clone)]
pub struct QuicServerConfig {
	pub bind_addr: SocketAddr,
	pub alpn_protocols: Vec<Vec<u8>>,
	/// Control stream plus the events stream, with headroom.
	pub max_concurrent_bidi_streams: u32,
	pub max_concurrent_uni_streams: u32,
	/// Transport-level idle timeout. The gateway reaper runs on its own clock.
	pub max_idle_timeout: Duration,
	pub keep_alive_interval: Option<Duration>,
}

impl QuicServerConfig {
	pub fn new(bind_addr: SocketAddr) -> Self {
		Self {
			bind_addr,
			alpn_protocols: vec![parley_protocol::version::ALPN.to_vec()],
			max_concurrent_bidi_streams: 8,
			max_concurrent_uni_streams: 0,
			max_idle_timeout: Duration::from_secs(120),
			keep_alive_interval: Some(Duration::from_secs(15)),
		}
	}

	/// Bind with a freshly generated self-signed cert; returns the cert DER for clients to pin.
	pub fn bind_dev_endpoint(&self) -> anyhow::Result<(Endpoint, Vec<u8>)> {
		let (server_config, cert_der) = self.build_dev_server_config()?;
		let endpoint = Endpoint::server(server_config, self.bind_addr).context("bind quinn endpoint")?;
		Ok((endpoint, cert_der))
	}

	pub fn bind_endpoint_with_tls(&self, cert_path: &Path, key_path: &Path) -> anyhow::Result<Endpoint> {
		let cert_chain = load_cert_chain(cert_path)?;
		let key = load_private_key(key_path)?;
		let server_config = self.build_server_config(cert_chain, key)?;
		Endpoint::server(server_config, self.bind_addr).context("bind quinn endpoint")
	}

	pub fn build_dev_server_config(&self) -> anyhow::Result<(ServerConfig, Vec<u8>)> {
		let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).context("generate self-signed cert")?;
		let cert_der = ck.cert.der().to_vec();
		let key = PrivateKeyDer::try_from(ck.signing_key.serialize_der())
			.map_err(|e| anyhow!("parse private key der: {e}"))?;

		let server_config = self.build_server_config(vec![CertificateDer::from(cert_der.clone())], key)?;
		Ok((server_config, cert_der))
	}

	fn build_server_config(
		&self,
		cert_chain: Vec<CertificateDer<'static>>,
		key: PrivateKeyDer<'static>,
	) -> anyhow::Result<ServerConfig> {
		let mut tls_config = rustls::ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(cert_chain, key)
			.context("build rustls server config")?;
		tls_config.alpn_protocols = self.alpn_protocols.clone();

		let quic_tls = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
			.context("convert rustls ServerConfig -> quinn QuicServerConfig")?;

		let mut server_config = ServerConfig::with_crypto(Arc::new(quic_tls));
		server_config.transport_config(Arc::new(self.transport()?));
		Ok(server_config)
	}

	fn transport(&self) -> anyhow::Result<TransportConfig> {
		let mut transport = TransportConfig::default();
		transport.max_concurrent_bidi_streams(VarInt::from_u32(self.max_concurrent_bidi_streams));
		transport.max_concurrent_uni_streams(VarInt::from_u32(self.max_concurrent_uni_streams));
		transport.max_idle_timeout(Some(
			IdleTimeout::try_from(self.max_idle_timeout).context("quic idle timeout out of range")?,
		));
		transport.keep_alive_interval(self.keep_alive_interval);
		Ok(transport)
	}
}

fn load_cert_chain(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let pem = fs::read(path).with_context(|| format!("read tls cert: {}", path.display()))?;
	let chain = certs(&mut BufReader::new(&pem[..]))
		.collect::<Result<Vec<_>, _>>()
		.context("parse tls certs")?;
	if chain.is_empty() {
		return Err(anyhow!("no certificates found in {}", path.display()));
	}
	Ok(chain)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
	let pem = fs::read(path).with_context(|| format!("read tls key: {}", path.display()))?;
	private_key(&mut BufReader::new(&pem[..]))
		.context("parse tls key")?
		.ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dev_config_negotiates_parley_alpn() {
		let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
		let cfg = QuicServerConfig::new("127.0.0.1:0".parse().unwrap());
		assert_eq!(cfg.alpn_protocols, vec![b"parley-v1".to_vec()]);
		let (_server, cert_der) = cfg.build_dev_server_config().unwrap();
		assert!(!cert_der.is_empty());
	}

	#[test]
	fn missing_pem_files_are_reported() {
		let dir = std::env::temp_dir();
		let err = load_cert_chain(&dir.join("parley-missing-cert.pem")).unwrap_err();
		assert!(format!("{err:#}").contains("read tls cert"));
	}
}
