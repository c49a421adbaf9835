//! Port forwarding seam.
//!
//! Hosts behind a NAT router may ask it to forward their listening ports.
//! The mechanism (UPnP, NAT-PMP, manual) lives behind [`PortForwarder`]; the
//! server only cares that failures are reported and never fatal.

use async_trait::async_trait;
use tracing::{info, warn};

/// Transport a forwarding rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[async_trait]
pub trait PortForwarder: Send + Sync {
    async fn forward(&self, port: u16, protocol: Protocol) -> anyhow::Result<()>;

    async fn unforward(&self, port: u16, protocol: Protocol) -> anyhow::Result<()>;
}

/// Forwarder that does nothing, for LAN play and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopForwarder;

#[async_trait]
impl PortForwarder for NoopForwarder {
    async fn forward(&self, _port: u16, _protocol: Protocol) -> anyhow::Result<()> {
        Ok(())
    }

    async fn unforward(&self, _port: u16, _protocol: Protocol) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Forwards both server ports, logging instead of failing.
pub async fn forward_ports(forwarder: &dyn PortForwarder, tcp_port: u16, udp_port: u16) {
    for (port, protocol) in [(tcp_port, Protocol::Tcp), (udp_port, Protocol::Udp)] {
        match forwarder.forward(port, protocol).await {
            Ok(()) => info!(port, ?protocol, "Port forwarded"),
            Err(e) => warn!(
                port,
                ?protocol,
                error = %e,
                "Port forwarding failed, forward the port manually"
            ),
        }
    }
}

/// Removes both forwarding rules, logging failures.
pub async fn unforward_ports(forwarder: &dyn PortForwarder, tcp_port: u16, udp_port: u16) {
    for (port, protocol) in [(tcp_port, Protocol::Tcp), (udp_port, Protocol::Udp)] {
        if let Err(e) = forwarder.unforward(port, protocol).await {
            warn!(port, ?protocol, error = %e, "Failed to remove port forwarding");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::bail;

    use super::*;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(bool, u16, Protocol)>>,
    }

    #[async_trait]
    impl PortForwarder for Recording {
        async fn forward(&self, port: u16, protocol: Protocol) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push((true, port, protocol));
            if protocol == Protocol::Tcp {
                bail!("router said no");
            }
            Ok(())
        }

        async fn unforward(&self, port: u16, protocol: Protocol) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push((false, port, protocol));
            Ok(())
        }
    }

    #[tokio::test]
    async fn failures_do_not_stop_remaining_ports() {
        let rec = Recording::default();
        forward_ports(&rec, 7777, 7778).await;
        unforward_ports(&rec, 7777, 7778).await;
        assert_eq!(
            *rec.calls.lock().unwrap(),
            vec![
                (true, 7777, Protocol::Tcp),
                (true, 7778, Protocol::Udp),
                (false, 7777, Protocol::Tcp),
                (false, 7778, Protocol::Udp),
            ]
        );
    }
}
