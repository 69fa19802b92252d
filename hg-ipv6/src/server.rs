use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::state_machine::Dhcp6Engine;

/// Run the DHCPv6 server on `[::]:547` until shutdown is signalled.
pub async fn run_dhcp6_server(
    engine: Arc<Dhcp6Engine>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let socket = UdpSocket::bind("[::]:547").await?;
    info!("DHCPv6 server listening on [::]:547");

    let mut buf = [0u8; 1500];

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("DHCPv6 server shutting down");
                    return Ok(());
                }
            }
            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("DHCPv6 recv error: {e}");
                        continue;
                    }
                };

                if let Some(reply) = engine.handle_packet(&buf[..len]).await {
                    if let Err(e) = socket.send_to(&reply, src).await {
                        warn!("Failed to send DHCPv6 reply to {src}: {e}");
                    }
                }
            }
        }
    }
}
