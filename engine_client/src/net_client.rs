//! Client transport endpoint.
//!
//! A [`NetClient`] owns one TCP control connection and one UDP socket to a
//! server. After the handshake three tasks run until shutdown:
//! - a TCP writer draining an outgoing frame queue
//! - a TCP reader turning frames into [`ClientEvent`]s
//! - a UDP reader forwarding snapshots from the server's UDP endpoint
//!
//! Whichever side ends the connection first, the disconnect notification is
//! raised exactly once.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use engine_shared::{
    action::NetAction,
    config::EngineConfig,
    framing::{split_tcp, FrameReader, FrameWriter},
    ids::ClientId,
    packet::{Packet, SnapshotPacket},
};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        lookup_host, TcpStream, UdpSocket,
    },
    sync::{mpsc, watch},
};
use tracing::{debug, info, trace, warn};

/// Largest datagram the UDP loop accepts.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Messages the network tasks hand to the owning session.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Chat { sender: String, message: String },
    SceneChange { scene_epoch: i32, scene_key: String },
    Snapshot(SnapshotPacket),
    Disconnected { reason: String },
}

/// What the server told us when it accepted the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptInfo {
    pub client_id: ClientId,
    pub server_name: String,
    pub server_udp: SocketAddr,
    pub scene_key: String,
    pub scene_epoch: i32,
}

/// State shared by the handle and its tasks.
struct Link {
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Link {
    /// Signals shutdown and reports `reason`. Only the first call counts.
    fn close(&self, reason: impl Into<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = reason.into();
        info!(%reason, "Disconnected");
        let _ = self.shutdown.send(true);
        let _ = self.events.send(ClientEvent::Disconnected { reason });
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connected client endpoint.
pub struct NetClient {
    accept: AcceptInfo,
    name: String,
    udp: Arc<UdpSocket>,
    tcp_tx: mpsc::UnboundedSender<Bytes>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    link: Arc<Link>,
}

impl NetClient {
    /// Connects using `host`, `tcp_port`, `client_udp_port` and
    /// `player_name` from the config.
    pub async fn connect(cfg: &EngineConfig) -> anyhow::Result<Self> {
        Self::connect_to(
            &cfg.host,
            cfg.tcp_port,
            cfg.client_udp_port,
            &cfg.player_name,
            cfg.connect_timeout(),
        )
        .await
    }

    /// Performs the handshake. Every failure path drops both sockets.
    pub async fn connect_to(
        host: &str,
        tcp_port: u16,
        local_udp_port: u16,
        name: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let server = resolve(host, tcp_port).await?;
        info!(%server, name, "Connecting to server");

        let stream = tokio::time::timeout(timeout, TcpStream::connect(server))
            .await
            .map_err(|_| anyhow!("timed out connecting to {server}"))?
            .with_context(|| format!("tcp connect {server}"))?;
        stream.set_nodelay(true).context("set_nodelay")?;

        let unspecified: IpAddr = if server.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let udp = UdpSocket::bind(SocketAddr::new(unspecified, local_udp_port))
            .await
            .context("udp bind")?;
        let udp_port = udp.local_addr().context("udp local_addr")?.port();

        let (mut reader, mut writer) = split_tcp(stream);
        let request = Packet::ConnectionRequest {
            name: name.to_string(),
            udp_port,
        };
        writer
            .send(&request.encode())
            .await
            .context("send connection request")?;

        let reply = tokio::time::timeout(timeout, reader.recv())
            .await
            .map_err(|_| anyhow!("timed out waiting for the server to respond"))?
            .ok_or_else(|| anyhow!("server closed connection before responding"))?;

        let accept = match Packet::decode(&reply).context("decode handshake reply")? {
            Packet::ConnectionAccept {
                client_id,
                server_name,
                server_udp_port,
                scene_key,
                scene_epoch,
            } => AcceptInfo {
                client_id,
                server_name,
                server_udp: SocketAddr::new(server.ip(), server_udp_port),
                scene_key,
                scene_epoch,
            },
            Packet::Disconnect { reason } => bail!("server refused connection: {reason}"),
            other => bail!("unexpected first packet from server: {:?}", other.packet_type()),
        };

        info!(
            client_id = %accept.client_id,
            server_name = %accept.server_name,
            server_udp = %accept.server_udp,
            "Connected to server"
        );
        Ok(Self::start(accept, name.to_string(), reader, writer, udp))
    }

    fn start(
        accept: AcceptInfo,
        name: String,
        reader: FrameReader<OwnedReadHalf>,
        writer: FrameWriter<OwnedWriteHalf>,
        udp: UdpSocket,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (event_tx, events) = mpsc::unbounded_channel();
        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            closed: AtomicBool::new(false),
            shutdown,
            events: event_tx,
        });
        let udp = Arc::new(udp);

        tokio::spawn(write_loop(writer, tcp_rx, shutdown_rx.clone(), link.clone()));
        tokio::spawn(tcp_read_loop(reader, shutdown_rx.clone(), link.clone()));
        tokio::spawn(udp_read_loop(
            udp.clone(),
            accept.server_udp,
            shutdown_rx,
            link.clone(),
        ));

        Self {
            accept,
            name,
            udp,
            tcp_tx,
            events,
            link,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.accept.client_id
    }

    pub fn accept_info(&self) -> &AcceptInfo {
        &self.accept
    }

    pub fn is_connected(&self) -> bool {
        !self.link.is_closed()
    }

    /// Sends one action packet over UDP. Fire and forget: a full socket
    /// buffer drops the packet, which later ones make up for.
    pub fn send_actions(&self, actions: &[NetAction]) {
        if !self.is_connected() || actions.is_empty() {
            return;
        }
        let packet = Packet::Action {
            client_id: self.accept.client_id,
            actions: actions.to_vec(),
        };
        if let Err(e) = self.udp.try_send_to(&packet.encode(), self.accept.server_udp) {
            debug!(error = %e, "Dropped action packet");
        }
    }

    pub fn send_chat(&self, message: &str) {
        self.send_tcp(Packet::Chat {
            sender: self.name.clone(),
            message: message.to_string(),
        });
    }

    fn send_tcp(&self, packet: Packet) {
        if self.is_connected() {
            let _ = self.tcp_tx.send(packet.encode());
        }
    }

    /// Tells the server we are leaving and shuts the connection down.
    pub fn disconnect(&self, reason: &str) {
        self.send_tcp(Packet::disconnect(reason));
        self.link.close(reason);
    }

    pub fn try_recv_event(&mut self) -> Option<ClientEvent> {
        self.events.try_recv().ok()
    }

    /// Waits for the next event. `None` once every task has exited and the
    /// queue is empty.
    pub async fn recv_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        self.disconnect("Client closed");
    }
}

/// Resolves `host`, preferring IPv4 addresses.
async fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .with_context(|| format!("resolve {host}"))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| anyhow!("no address found for host {host:?}"))
}

async fn write_loop(
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    link: Arc<Link>,
) {
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = writer.send(&msg).await {
                    link.close(format!("TCP send error: {e:#}"));
                    break;
                }
            }
            _ = shutdown.changed() => {
                // Flush whatever was queued before the shutdown, e.g. our
                // own Disconnect packet.
                while let Ok(msg) = rx.try_recv() {
                    if writer.send(&msg).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    writer.close().await;
}

async fn tcp_read_loop(
    mut reader: FrameReader<OwnedReadHalf>,
    mut shutdown: watch::Receiver<bool>,
    link: Arc<Link>,
) {
    loop {
        let frame = tokio::select! {
            frame = reader.recv() => frame,
            _ = shutdown.changed() => break,
        };
        let Some(frame) = frame else {
            link.close("Server closed the TCP connection");
            break;
        };

        match Packet::decode(&frame) {
            Ok(Packet::Chat { sender, message }) => {
                let _ = link.events.send(ClientEvent::Chat { sender, message });
            }
            Ok(Packet::SceneChange {
                scene_epoch,
                scene_key,
            }) => {
                let _ = link.events.send(ClientEvent::SceneChange {
                    scene_epoch,
                    scene_key,
                });
            }
            Ok(Packet::Disconnect { reason }) => {
                link.close(reason);
                break;
            }
            Ok(other) => debug!(kind = ?other.packet_type(), "Ignoring TCP packet"),
            Err(e) => {
                warn!(error = %e, "Malformed TCP packet from server");
                link.close(format!("Protocol error: {e}"));
                break;
            }
        }
    }
    reader.close();
}

async fn udp_read_loop(
    udp: Arc<UdpSocket>,
    server: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
    link: Arc<Link>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (len, from) = tokio::select! {
            res = udp.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    // Connection-reset style errors are reported per datagram
                    // on some platforms; the socket stays usable.
                    debug!(error = %e, "UDP receive error");
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        if from != server {
            trace!(%from, "Dropping datagram from unknown sender");
            continue;
        }
        match Packet::decode(&buf[..len]) {
            Ok(Packet::Snapshot(snap)) => {
                let _ = link.events.send(ClientEvent::Snapshot(snap));
            }
            Ok(other) => debug!(kind = ?other.packet_type(), "Ignoring UDP packet"),
            Err(e) => debug!(error = %e, "Dropping malformed datagram"),
        }
    }
}
