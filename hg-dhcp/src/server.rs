use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::packet::DhcpPacket;
use crate::state_machine::Dhcp4Engine;
use crate::transport::Transport;

/// Run the DHCPv4 server until shutdown is signalled.
///
/// Packets are handled strictly serially: the reply to one packet is sent
/// before the next is read.
pub async fn run_dhcp4_server(
    engine: Arc<Dhcp4Engine>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let transport = Transport::bind(engine.config())?;
    info!("DHCPv4 server listening on 0.0.0.0:67");

    let mut buf = [0u8; 1500];

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("DHCPv4 server shutting down");
                    return Ok(());
                }
            }
            result = transport.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("DHCP recv error: {e}");
                        continue;
                    }
                };

                let packet = match DhcpPacket::parse(&buf[..len]) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("Invalid DHCP packet from {src}: {e}");
                        continue;
                    }
                };

                if let Some((response, peer)) = engine.handle_packet(&packet).await {
                    let bytes = response.to_bytes();
                    if let Err(e) = transport.write_to(&bytes, &peer).await {
                        warn!("Failed to send DHCP response: {e:#}");
                    }
                }
            }
        }
    }
}
