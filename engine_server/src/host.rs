//! Authoritative host session.
//!
//! The host owns the authoritative [`GameState`] and a [`NetServer`]. Each
//! tick it applies the actions clients sent, steps the simulation and, at the
//! snapshot rate, broadcasts the replicated world to every client over UDP.
//!
//! With a local player the host also runs a [`ClientSession`] connected over
//! loopback, so the hosting player goes through the same prediction path as
//! everyone else and gets a regular client id.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Context;
use engine_client::session::ClientSession;
use engine_shared::{
    action::NetAction,
    ids::ClientId,
    packet::{encode_snapshot, Packet},
    render::{render_tree, RenderBackend},
    session::{GameSession, SessionContext, SessionEvent, SessionKind},
    state::GameState,
};
use tracing::{debug, info, warn};

use crate::{
    nat::{NoopForwarder, PortForwarder},
    net_server::{ClientInfo, NetServer, ServerEvent},
};

pub struct HostSession {
    ctx: SessionContext,
    state: GameState,
    server: NetServer,
    local: Option<ClientSession>,
    /// Highest applied action sequence per client.
    last_processed: BTreeMap<ClientId, u32>,
    snapshot_interval: f32,
    snapshot_timer: f32,
    events: Vec<SessionEvent>,
    stopped: bool,
}

impl HostSession {
    /// Starts hosting the config's start scene without port forwarding.
    pub async fn start(ctx: SessionContext, local_player: bool) -> anyhow::Result<Self> {
        Self::start_with_forwarder(ctx, local_player, Arc::new(NoopForwarder)).await
    }

    pub async fn start_with_forwarder(
        ctx: SessionContext,
        local_player: bool,
        forwarder: Arc<dyn PortForwarder>,
    ) -> anyhow::Result<Self> {
        let mut state = ctx.new_state(&ctx.config.start_scene)?;
        state.register_existing_objects();

        let server = NetServer::start(&ctx.config, forwarder)
            .await
            .context("start server")?;
        server.set_scene(state.scene_key(), state.scene_epoch);

        let local = if local_player {
            let mut config = ctx.config.clone();
            config.host = loopback_host(&ctx.config.bind_addr);
            config.tcp_port = server.tcp_port();
            config.client_udp_port = 0;
            let mut client = ClientSession::new(SessionContext {
                config,
                ..ctx.clone()
            })?;
            client.connect().await.context("connect local player")?;
            Some(client)
        } else {
            None
        };

        let snapshot_interval = ctx.config.snapshot_interval_secs();
        info!(
            scene = state.scene_key(),
            tcp_port = server.tcp_port(),
            udp_port = server.udp_port(),
            local_player,
            "Host session started"
        );
        Ok(Self {
            ctx,
            state,
            server,
            local,
            last_processed: BTreeMap::new(),
            snapshot_interval,
            snapshot_timer: snapshot_interval,
            events: Vec::new(),
            stopped: false,
        })
    }

    pub fn server(&self) -> &NetServer {
        &self.server
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.server.clients()
    }

    /// The loopback client of the hosting player, if any.
    pub fn local_session(&self) -> Option<&ClientSession> {
        self.local.as_ref()
    }

    pub fn last_processed(&self, client: ClientId) -> Option<u32> {
        self.last_processed.get(&client).copied()
    }

    pub fn kick(&self, client: ClientId, reason: Option<&str>) -> bool {
        self.server.kick(client, reason)
    }

    /// Sends a chat line from the server itself to every client.
    pub fn say(&self, message: &str) {
        self.server.broadcast_tcp(&Packet::Chat {
            sender: self.ctx.config.server_name.clone(),
            message: message.to_string(),
        });
    }

    /// Spawns the pawn of `client_id` unless it already has one.
    fn spawn_pawn(&mut self, client_id: ClientId, name: &str) {
        if self.state.pawn(client_id).is_some() {
            return;
        }
        let mut pawn = self.ctx.spawn_player();
        pawn.state.name = name.to_string();
        if self.state.add_object(pawn, None, client_id).is_none() {
            warn!(%client_id, "Could not spawn pawn");
        }
    }

    fn process_server_events(&mut self) {
        while let Some(event) = self.server.try_recv_event() {
            match event {
                ServerEvent::ClientConnected { client_id, name } => {
                    self.spawn_pawn(client_id, &name);
                    self.events
                        .push(SessionEvent::ClientJoined { client_id, name });
                }
                ServerEvent::ClientDisconnected { client_id, .. } => {
                    let removed = self.state.remove_client_objects(client_id);
                    self.last_processed.remove(&client_id);
                    debug!(%client_id, removed, "Removed client objects");
                    self.events.push(SessionEvent::ClientLeft { client_id });
                }
                ServerEvent::Chat {
                    sender, message, ..
                } => {
                    // A local player sees chat through its own connection.
                    if self.local.is_none() {
                        self.events.push(SessionEvent::Chat { sender, message });
                    }
                }
                ServerEvent::Actions {
                    client_id, actions, ..
                } => self.apply_actions(client_id, &actions),
            }
        }
    }

    fn apply_actions(&mut self, client_id: ClientId, actions: &[NetAction]) {
        if !self.server.has_client(client_id) {
            debug!(%client_id, "Dropping actions for a client not in the roster");
            return;
        }
        let last = self.last_processed.entry(client_id).or_insert(0);
        for action in actions {
            action.apply(&mut self.state, client_id);
            *last = (*last).max(action.sequence);
        }
    }

    fn broadcast_snapshot(&mut self) {
        self.state.update_dirty_flags();
        let payload = encode_snapshot(
            self.state.scene_epoch,
            self.state.tick,
            &self.last_processed,
            self.state.world(),
        );
        self.server.broadcast_udp(&payload);
        self.state.clear_dirty_flags();
    }
}

/// Address the loopback client dials for a server bound to `bind_addr`.
fn loopback_host(bind_addr: &str) -> String {
    match bind_addr.parse::<std::net::IpAddr>() {
        Ok(ip) if ip.is_unspecified() && ip.is_ipv6() => "::1".to_string(),
        Ok(ip) if ip.is_unspecified() => "127.0.0.1".to_string(),
        _ => bind_addr.to_string(),
    }
}

impl GameSession for HostSession {
    fn kind(&self) -> SessionKind {
        SessionKind::MultiplayerHost
    }

    fn state(&self) -> &GameState {
        &self.state
    }

    fn handle_input(&mut self, actions: Vec<NetAction>) {
        if let Some(local) = self.local.as_mut() {
            local.handle_input(actions);
        }
    }

    fn update(&mut self, dt: f32) {
        if self.stopped {
            return;
        }
        self.process_server_events();
        self.state.update(dt);

        self.snapshot_timer -= dt;
        if self.snapshot_timer <= 0.0 {
            self.broadcast_snapshot();
            self.snapshot_timer = self.snapshot_interval;
        }

        if let Some(local) = self.local.as_mut() {
            local.update(dt);
            self.events.extend(local.drain_events());
        }
    }

    fn switch_scene(&mut self, key: &str) -> anyhow::Result<()> {
        // Joins still queued must not spawn into the new scene a second time.
        self.process_server_events();
        self.state.switch_scene(key)?;
        self.state.scene_epoch += 1;
        self.state.register_existing_objects();
        for client in self.server.clients() {
            self.spawn_pawn(client.client_id, &client.name);
        }

        let scene_epoch = self.state.scene_epoch;
        self.server.set_scene(key, scene_epoch);
        self.server.broadcast_tcp(&Packet::SceneChange {
            scene_epoch,
            scene_key: key.to_string(),
        });
        info!(scene = key, epoch = scene_epoch, "Scene changed");

        if self.local.is_none() {
            self.events.push(SessionEvent::SceneChanged {
                scene_key: key.to_string(),
                scene_epoch,
            });
        }
        Ok(())
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(local) = self.local.as_mut() {
            local.stop();
        }
        self.server.stop();
        info!("Host session stopped");
    }

    fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// The hosting player sees its predicted view.
    fn render(&self, renderer: &mut dyn RenderBackend) {
        let state = self.local.as_ref().map_or(&self.state, |l| l.state());
        let scene = state.scene();
        renderer.begin_frame();
        render_tree(&scene.world, renderer);
        render_tree(&scene.ui, renderer);
        renderer.end_frame();
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use engine_shared::{
        config::EngineConfig,
        framing::{read_frame, write_frame},
        math::Vec2,
        object::ObjectKind,
    };
    use tokio::net::{TcpStream, UdpSocket};

    use super::*;

    fn host_config() -> EngineConfig {
        EngineConfig {
            bind_addr: "127.0.0.1".into(),
            tcp_port: 0,
            udp_port: 0,
            max_players: 4,
            ..Default::default()
        }
    }

    /// Ticks the host until `done` holds or a second has passed.
    async fn tick_until(host: &mut HostSession, mut done: impl FnMut(&HostSession) -> bool) -> bool {
        for _ in 0..100 {
            host.update(1.0 / 60.0);
            if done(host) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn loopback_host_for_bind_addresses() {
        assert_eq!(loopback_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(loopback_host("::"), "::1");
        assert_eq!(loopback_host("192.168.1.4"), "192.168.1.4");
    }

    #[tokio::test]
    async fn local_player_gets_pawn_and_moves() {
        let ctx = SessionContext::new(host_config());
        let mut host = HostSession::start(ctx, true).await.unwrap();
        let me = host.local_session().unwrap().client_id();
        assert_eq!(me, ClientId(1));

        assert!(tick_until(&mut host, |h| h.state().pawn(me).is_some()).await);

        host.handle_input(vec![NetAction::movement(Vec2::new(1.0, 0.0))]);
        assert!(tick_until(&mut host, |h| h.last_processed(me) == Some(1)).await);
        let pawn = host.state().pawn(me).and_then(|k| host.state().world().get(k));
        assert_eq!(pawn.map(|p| p.state.direction), Some(Vec2::new(1.0, 0.0)));
    }

    #[tokio::test]
    async fn scene_switch_respawns_connected_pawns() {
        let ctx = SessionContext::new(host_config());
        let mut host = HostSession::start(ctx, true).await.unwrap();
        let me = ClientId(1);
        assert!(tick_until(&mut host, |h| h.state().pawn(me).is_some()).await);

        host.switch_scene("garden").unwrap();
        assert_eq!(host.state().scene_epoch, 1);
        assert!(host.state().pawn(me).is_some());

        assert!(
            tick_until(&mut host, |h| {
                h.local_session()
                    .is_some_and(|l| l.state().scene_key() == "garden" && l.state().pawn(me).is_some())
            })
            .await
        );
    }

    fn pawns_owned_by(host: &HostSession, client: ClientId) -> usize {
        host.state()
            .world()
            .iter()
            .filter(|(_, o)| o.owner == client && o.kind() == ObjectKind::Player)
            .count()
    }

    #[tokio::test]
    async fn scene_switch_before_join_is_processed_spawns_one_pawn() {
        let ctx = SessionContext::new(host_config());
        let mut host = HostSession::start(ctx, false).await.unwrap();

        let mut cfg = host_config();
        cfg.host = "127.0.0.1".into();
        cfg.tcp_port = host.server().tcp_port();
        let mut client = ClientSession::new(SessionContext::new(cfg)).unwrap();
        client.connect().await.unwrap();

        // The join is still queued when the scene changes.
        host.switch_scene("garden").unwrap();
        host.update(1.0 / 60.0);
        assert_eq!(pawns_owned_by(&host, ClientId(1)), 1);
        assert_eq!(
            host.drain_events()
                .iter()
                .filter(|e| matches!(e, SessionEvent::ClientJoined { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn actions_for_unknown_clients_are_not_tracked() {
        let ctx = SessionContext::new(host_config());
        let mut host = HostSession::start(ctx, false).await.unwrap();

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut stream = TcpStream::connect(host.server().local_tcp_addr())
            .await
            .unwrap();
        let req = Packet::ConnectionRequest {
            name: "mallory".into(),
            udp_port: udp.local_addr().unwrap().port(),
        };
        write_frame(&mut stream, &req.encode()).await.unwrap();
        assert!(read_frame(&mut stream).await.is_some());

        let server_udp = ("127.0.0.1", host.server().udp_port());
        let mut action = NetAction::movement(Vec2::new(1.0, 0.0));
        action.sequence = 9;
        for claimed in 1000..1050 {
            let forged = Packet::Action {
                client_id: ClientId(claimed),
                actions: vec![action],
            };
            udp.send_to(&forged.encode(), server_udp).await.unwrap();
        }
        action.sequence = 1;
        let genuine = Packet::Action {
            client_id: ClientId(1),
            actions: vec![action],
        };
        udp.send_to(&genuine.encode(), server_udp).await.unwrap();

        assert!(tick_until(&mut host, |h| h.last_processed(ClientId(1)) == Some(1)).await);
        assert!((1000..1050).all(|id| host.last_processed(ClientId(id)).is_none()));

        drop(stream);
        assert!(tick_until(&mut host, |h| h.last_processed(ClientId(1)).is_none()).await);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let ctx = SessionContext::new(host_config());
        let mut host = HostSession::start(ctx, false).await.unwrap();
        host.stop();
        host.stop();
        assert!(!host.server().is_running());
    }
}
