#![forbid(unsafe_code)]

use tracing::{info, warn};

use crate::server::gateway::Gateway;
use crate::server::session::{SessionSettings, handle_connection};

/// Accept QUIC connections until the endpoint is closed, one task per connection.
pub async fn run_accept_loop(endpoint: quinn::Endpoint, gateway: Gateway, settings: SessionSettings) {
	let mut next_transport_id: u64 = 1;

	while let Some(incoming) = endpoint.accept().await {
		let transport_id = next_transport_id;
		next_transport_id += 1;
		metrics::counter!("parley_server_connections_total").increment(1);

		let gateway = gateway.clone();
		let settings = settings.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					info!(transport_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(transport_id, connection, gateway, settings).await {
						warn!(transport_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(transport_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	info!("endpoint closed; accept loop finished");
}
