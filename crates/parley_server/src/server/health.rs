#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

/// Liveness and readiness flags served over plain HTTP.
///
/// Ready means startup finished and the last storage probe succeeded.
#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	storage_ok: Arc<AtomicBool>,
}

impl Default for HealthState {
	fn default() -> Self {
		Self::new()
	}
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			storage_ok: Arc::new(AtomicBool::new(true)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn set_storage_ok(&self, ok: bool) {
		let was = self.storage_ok.swap(ok, Ordering::Relaxed);
		if was && !ok {
			warn!("storage probe failing; reporting not ready");
		}
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed) && self.storage_ok.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		let result = async {
			let listener = TcpListener::bind(bind).await?;
			serve_health(listener, state).await
		}
		.await;
		if let Err(err) = result {
			warn!(error = %err, "health server stopped");
		}
	});
}

/// Serve health requests on an already bound listener.
pub async fn serve_health(listener: TcpListener, state: HealthState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body)));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, b""));
	}

	Ok(match req.uri().path() {
		"/healthz" => respond(StatusCode::OK, b"ok"),
		"/readyz" if state.is_ready() => respond(StatusCode::OK, b"ready"),
		"/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, b"not-ready"),
		_ => respond(StatusCode::NOT_FOUND, b""),
	})
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpStream;

	use super::*;

	async fn get(addr: SocketAddr, path: &str) -> String {
		let mut stream = TcpStream::connect(addr).await.expect("connect");
		let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
		stream.write_all(req.as_bytes()).await.expect("write");
		let mut out = String::new();
		tokio::time::timeout(Duration::from_secs(2), stream.read_to_string(&mut out))
			.await
			.expect("response within timeout")
			.expect("read");
		out
	}

	#[tokio::test]
	async fn readiness_follows_startup_and_storage() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let state = HealthState::new();
		tokio::spawn(serve_health(listener, state.clone()));

		assert!(get(addr, "/healthz").await.starts_with("HTTP/1.1 200"));
		assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 503"));

		state.mark_ready();
		assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 200"));

		state.set_storage_ok(false);
		assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 503"));
		assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));
	}
}
