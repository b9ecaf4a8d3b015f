use iroh::endpoint::{Connection, ConnectionType};
use iroh::{Endpoint, EndpointId, Watcher};
use qrdrop_core::AppEvent;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::protocol::MONITOR_INTERVAL;

/// Display label for a connection type
pub fn connection_type_label(conn_type: &ConnectionType) -> &'static str {
    match conn_type {
        ConnectionType::Direct(_) => "Direct ✓",
        ConnectionType::Relay(_) => "Relay",
        ConnectionType::Mixed(_, _) => "Mixed",
        ConnectionType::None => "None",
    }
}

/// Monitor connection type (Direct/Relay) and send updates to the UI
///
/// Polls until the connection closes or the UI stops listening.
pub async fn spawn_connection_monitor(
    endpoint: Endpoint,
    peer_id: EndpointId,
    connection: Connection,
    event_tx: mpsc::Sender<AppEvent>,
) {
    info!("Starting connection monitor for peer: {}", peer_id);

    let mut last_label = "";
    let mut interval = tokio::time::interval(MONITOR_INTERVAL);

    loop {
        tokio::select! {
            _ = connection.closed() => break,
            _ = interval.tick() => {}
        }

        let Some(mut watcher) = endpoint.conn_type(peer_id) else {
            warn!("Could not get connection type watcher for peer: {}", peer_id);
            break;
        };
        let label = connection_type_label(&watcher.get());
        let rtt = connection.rtt();

        if label != last_label {
            info!("Connection type changed to: {} (RTT: {:?})", label, rtt);
            last_label = label;
        }

        let sent = event_tx
            .send(AppEvent::ConnectionInfo {
                connection_type: label.to_string(),
                rtt_ms: Some(rtt.as_millis() as u64),
            })
            .await;
        if sent.is_err() {
            break;
        }
    }

    info!("Connection monitor stopped for peer: {}", peer_id);
}
