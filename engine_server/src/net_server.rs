//! Server transport endpoint.
//!
//! [`NetServer`] listens for TCP control connections and owns one UDP socket
//! for gameplay traffic. Each admitted client gets a writer task and a reader
//! task; a single UDP task routes action datagrams by source endpoint.
//! Everything the simulation needs to know arrives as a [`ServerEvent`].
//!
//! Client disconnects go through one path that removes the roster entry, so
//! `ClientDisconnected` fires exactly once per admitted client.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use anyhow::Context;
use bytes::Bytes;
use engine_shared::{
    action::NetAction,
    config::EngineConfig,
    framing::{split_tcp, FrameReader, FrameWriter},
    ids::ClientId,
    packet::Packet,
};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    sync::{mpsc, watch},
};
use tracing::{debug, info, trace, warn};

use crate::nat::{forward_ports, unforward_ports, PortForwarder};

/// Largest datagram the UDP loop accepts.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

pub const KICK_REASON: &str = "You have been kicked from the server";
pub const SHUTDOWN_REASON: &str = "Server shutting down";
pub const SERVER_FULL_REASON: &str = "Server Full";

/// Messages the network tasks hand to the simulation.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ClientConnected {
        client_id: ClientId,
        name: String,
    },
    ClientDisconnected {
        client_id: ClientId,
        reason: String,
    },
    /// Chat received from a client; it has already been rebroadcast.
    Chat {
        client_id: ClientId,
        sender: String,
        message: String,
    },
    /// Action datagram from a known endpoint. `sender` is the roster entry
    /// the endpoint belongs to, `client_id` what the packet claims.
    Actions {
        sender: ClientId,
        client_id: ClientId,
        actions: Vec<NetAction>,
    },
}

/// Public view of a roster entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub name: String,
    pub udp_addr: SocketAddr,
}

struct ClientEntry {
    info: ClientInfo,
    tcp_tx: mpsc::UnboundedSender<Bytes>,
    close: watch::Sender<bool>,
}

struct Roster {
    next_id: i32,
    clients: BTreeMap<ClientId, ClientEntry>,
}

/// Scene info handed to clients in their accept packet.
#[derive(Debug, Clone)]
struct SceneInfo {
    key: String,
    epoch: i32,
}

struct Shared {
    server_name: String,
    max_players: usize,
    handshake_timeout: Duration,
    udp_port: u16,
    udp: Arc<UdpSocket>,
    roster: RwLock<Roster>,
    scene: RwLock<SceneInfo>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl Shared {
    fn roster(&self) -> RwLockReadGuard<'_, Roster> {
        self.roster.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn roster_mut(&self) -> RwLockWriteGuard<'_, Roster> {
        self.roster.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn scene(&self) -> SceneInfo {
        self.scene
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn broadcast_tcp(&self, payload: Bytes) {
        for entry in self.roster().clients.values() {
            let _ = entry.tcp_tx.send(payload.clone());
        }
    }

    /// Removes `client_id` and closes its connection. Returns false if it
    /// was already gone.
    fn remove_client(&self, client_id: ClientId, reason: impl Into<String>) -> bool {
        let Some(entry) = self.roster_mut().clients.remove(&client_id) else {
            return false;
        };
        let reason = reason.into();
        info!(%client_id, name = %entry.info.name, %reason, "Client disconnected");
        let _ = entry.close.send(true);
        let _ = self
            .events
            .send(ServerEvent::ClientDisconnected { client_id, reason });
        true
    }
}

/// Listening server endpoint.
pub struct NetServer {
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    shutdown: watch::Sender<bool>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    forwarder: Option<Arc<dyn PortForwarder>>,
    stopped: bool,
}

impl NetServer {
    /// Binds TCP on `bind_addr:tcp_port` and UDP on `bind_addr:udp_port`
    /// (0 picks an ephemeral port) and starts the network tasks.
    pub async fn start(
        cfg: &EngineConfig,
        forwarder: Arc<dyn PortForwarder>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((cfg.bind_addr.as_str(), cfg.tcp_port))
            .await
            .with_context(|| format!("tcp bind {}:{}", cfg.bind_addr, cfg.tcp_port))?;
        let tcp_addr = listener.local_addr().context("tcp local_addr")?;

        let udp = UdpSocket::bind((cfg.bind_addr.as_str(), cfg.udp_port))
            .await
            .with_context(|| format!("udp bind {}:{}", cfg.bind_addr, cfg.udp_port))?;
        let udp_addr = udp.local_addr().context("udp local_addr")?;
        let udp = Arc::new(udp);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (event_tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            server_name: cfg.server_name.clone(),
            max_players: cfg.max_players,
            handshake_timeout: cfg.handshake_timeout(),
            udp_port: udp_addr.port(),
            udp: udp.clone(),
            roster: RwLock::new(Roster {
                next_id: 1,
                clients: BTreeMap::new(),
            }),
            scene: RwLock::new(SceneInfo {
                key: cfg.start_scene.clone(),
                epoch: 0,
            }),
            events: event_tx,
        });

        tokio::spawn(accept_loop(listener, shared.clone(), shutdown_rx.clone()));
        tokio::spawn(udp_loop(shared.clone(), shutdown_rx));

        let forwarder = if cfg.use_port_forwarding {
            let fwd = forwarder.clone();
            let (tcp_port, udp_port) = (tcp_addr.port(), udp_addr.port());
            tokio::spawn(async move { forward_ports(fwd.as_ref(), tcp_port, udp_port).await });
            Some(forwarder)
        } else {
            None
        };

        info!(tcp = %tcp_addr, udp = %udp_addr, max_players = cfg.max_players, "Server listening");
        Ok(Self {
            shared,
            events,
            shutdown,
            tcp_addr,
            udp_addr,
            forwarder,
            stopped: false,
        })
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_addr.port()
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_addr.port()
    }

    pub fn local_tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn is_running(&self) -> bool {
        !self.stopped
    }

    pub fn client_count(&self) -> usize {
        self.shared.roster().clients.len()
    }

    pub fn has_client(&self, client_id: ClientId) -> bool {
        self.shared.roster().clients.contains_key(&client_id)
    }

    /// Connected clients in id order.
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.shared
            .roster()
            .clients
            .values()
            .map(|c| c.info.clone())
            .collect()
    }

    /// Scene advertised to clients that connect from now on.
    pub fn set_scene(&self, key: &str, epoch: i32) {
        *self
            .shared
            .scene
            .write()
            .unwrap_or_else(PoisonError::into_inner) = SceneInfo {
            key: key.to_string(),
            epoch,
        };
    }

    /// Queues `packet` on every client's TCP connection.
    pub fn broadcast_tcp(&self, packet: &Packet) {
        self.shared.broadcast_tcp(packet.encode());
    }

    /// Sends `payload` to every client's UDP endpoint. Datagrams that do
    /// not fit the socket buffer are dropped.
    pub fn broadcast_udp(&self, payload: &[u8]) {
        for entry in self.shared.roster().clients.values() {
            if let Err(e) = self.shared.udp.try_send_to(payload, entry.info.udp_addr) {
                debug!(client_id = %entry.info.client_id, error = %e, "Dropped datagram");
            }
        }
    }

    /// Sends `client_id` a Disconnect and drops it.
    pub fn kick(&self, client_id: ClientId, reason: Option<&str>) -> bool {
        let reason = reason.unwrap_or(KICK_REASON);
        if let Some(entry) = self.shared.roster().clients.get(&client_id) {
            let _ = entry.tcp_tx.send(Packet::disconnect(reason).encode());
        }
        self.shared.remove_client(client_id, reason)
    }

    pub fn try_recv_event(&mut self) -> Option<ServerEvent> {
        self.events.try_recv().ok()
    }

    pub async fn recv_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Tells every client the server is going away, closes all connections
    /// and stops the network tasks. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("Server stopping");

        self.shared
            .broadcast_tcp(Packet::disconnect(SHUTDOWN_REASON).encode());
        let ids: Vec<ClientId> = self.shared.roster().clients.keys().copied().collect();
        for id in ids {
            self.shared.remove_client(id, SHUTDOWN_REASON);
        }
        let _ = self.shutdown.send(true);

        if let Some(fwd) = self.forwarder.take() {
            let (tcp_port, udp_port) = (self.tcp_port(), self.udp_port());
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move { unforward_ports(fwd.as_ref(), tcp_port, udp_port).await });
            }
        }
    }
}

impl Drop for NetServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };
        debug!(%peer, "Incoming connection");
        tokio::spawn(handle_connection(
            stream,
            peer,
            shared.clone(),
            shutdown.clone(),
        ));
    }
    debug!("Accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "set_nodelay failed");
    }
    let (mut reader, mut writer) = split_tcp(stream);

    let first = tokio::select! {
        res = tokio::time::timeout(shared.handshake_timeout, reader.recv()) => res,
        _ = shutdown.changed() => return,
    };
    let (name, udp_port) = match first {
        Ok(Some(frame)) => match Packet::decode(&frame) {
            Ok(Packet::ConnectionRequest { name, udp_port }) => (name, udp_port),
            Ok(other) => {
                debug!(%peer, kind = ?other.packet_type(), "Expected a connection request");
                return;
            }
            Err(e) => {
                debug!(%peer, error = %e, "Malformed handshake");
                return;
            }
        },
        Ok(None) => {
            debug!(%peer, "Connection closed during handshake");
            return;
        }
        Err(_) => {
            debug!(%peer, "Handshake timed out");
            return;
        }
    };

    let udp_addr = SocketAddr::new(peer.ip(), udp_port);
    let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();
    let (close, close_rx) = watch::channel(false);

    let admitted = {
        let mut roster = shared.roster_mut();
        if roster.clients.len() >= shared.max_players {
            None
        } else {
            let client_id = ClientId(roster.next_id);
            roster.next_id += 1;
            let scene = shared.scene();
            // Queued before the entry becomes visible so no broadcast can
            // overtake it.
            let _ = tcp_tx.send(
                Packet::ConnectionAccept {
                    client_id,
                    server_name: shared.server_name.clone(),
                    server_udp_port: shared.udp_port,
                    scene_key: scene.key,
                    scene_epoch: scene.epoch,
                }
                .encode(),
            );
            let info = ClientInfo {
                client_id,
                name: name.clone(),
                udp_addr,
            };
            roster.clients.insert(
                client_id,
                ClientEntry {
                    info,
                    tcp_tx,
                    close,
                },
            );
            let _ = shared.events.send(ServerEvent::ClientConnected {
                client_id,
                name: name.clone(),
            });
            Some(client_id)
        }
    };

    let Some(client_id) = admitted else {
        info!(%peer, %name, "Refusing connection, server full");
        let _ = writer
            .send(&Packet::disconnect(SERVER_FULL_REASON).encode())
            .await;
        writer.close().await;
        return;
    };

    info!(%client_id, %name, %udp_addr, "Client connected");
    tokio::spawn(connection_writer(
        writer,
        tcp_rx,
        close_rx.clone(),
        shutdown.clone(),
    ));
    connection_reader(reader, client_id, shared, close_rx, shutdown).await;
}

async fn connection_writer(
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut close: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if writer.send(&msg).await.is_err() {
                    break;
                }
            }
            _ = close.changed() => break,
            _ = shutdown.changed() => break,
        }
    }
    // Flush what was queued before closing, e.g. a kick notice.
    while let Ok(msg) = rx.try_recv() {
        if writer.send(&msg).await.is_err() {
            break;
        }
    }
    writer.close().await;
}

async fn connection_reader(
    mut reader: FrameReader<OwnedReadHalf>,
    client_id: ClientId,
    shared: Arc<Shared>,
    mut close: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            frame = reader.recv() => frame,
            _ = close.changed() => break,
            _ = shutdown.changed() => break,
        };
        let Some(frame) = frame else {
            shared.remove_client(client_id, "Connection closed");
            break;
        };

        match Packet::decode(&frame) {
            Ok(Packet::Chat { sender, message }) => {
                info!(%client_id, %sender, %message, "Chat");
                shared.broadcast_tcp(
                    Packet::Chat {
                        sender: sender.clone(),
                        message: message.clone(),
                    }
                    .encode(),
                );
                let _ = shared.events.send(ServerEvent::Chat {
                    client_id,
                    sender,
                    message,
                });
            }
            Ok(Packet::Disconnect { reason }) => {
                shared.remove_client(client_id, reason);
                break;
            }
            Ok(other) => debug!(%client_id, kind = ?other.packet_type(), "Ignoring TCP packet"),
            Err(e) => {
                warn!(%client_id, error = %e, "Malformed TCP packet");
                shared.remove_client(client_id, format!("Protocol error: {e}"));
                break;
            }
        }
    }
    reader.close();
}

async fn udp_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (len, from) = tokio::select! {
            res = shared.udp.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "UDP receive error");
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        let sender = shared
            .roster()
            .clients
            .values()
            .find(|c| c.info.udp_addr == from)
            .map(|c| c.info.client_id);
        let Some(sender) = sender else {
            trace!(%from, "Dropping datagram from unknown endpoint");
            continue;
        };

        match Packet::decode(&buf[..len]) {
            Ok(Packet::Action { client_id, actions }) => {
                if client_id != sender {
                    debug!(%sender, claimed = %client_id, "Action packet client id mismatch");
                }
                let _ = shared.events.send(ServerEvent::Actions {
                    sender,
                    client_id,
                    actions,
                });
            }
            Ok(other) => debug!(%sender, kind = ?other.packet_type(), "Ignoring UDP packet"),
            Err(e) => debug!(%sender, error = %e, "Dropping malformed datagram"),
        }
    }
    debug!("UDP loop stopped");
}
