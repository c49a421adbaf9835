//! Multiplayer client session: prediction and reconciliation.
//!
//! Local actions are stamped with increasing sequence numbers, applied to the
//! predicted state right away, buffered as pending and sent to the server.
//! Each authoritative snapshot of the current scene epoch replaces the
//! replicated tree; pending actions the server has already applied are
//! dropped and the rest are replayed on top.

use std::collections::VecDeque;

use anyhow::bail;
use engine_shared::{
    action::NetAction,
    ids::ClientId,
    packet::SnapshotPacket,
    replication::merge_snapshot,
    session::{GameSession, SessionContext, SessionEvent, SessionKind},
    state::GameState,
};
use tracing::{debug, info, warn};

use crate::net_client::{ClientEvent, NetClient};

/// Connection lifecycle of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct ClientSession {
    ctx: SessionContext,
    state: GameState,
    link: Option<NetClient>,
    connection: ConnectionState,
    client_id: ClientId,
    /// Actions of the current frame, already stamped.
    frame_actions: Vec<NetAction>,
    /// Sent but not yet acknowledged, in sequence order.
    pending: VecDeque<NetAction>,
    next_sequence: u32,
    /// Latest snapshot from an epoch we have not switched to yet.
    future_snapshot: Option<SnapshotPacket>,
    events: Vec<SessionEvent>,
}

impl ClientSession {
    /// Creates a disconnected session showing the loading scene.
    pub fn new(ctx: SessionContext) -> anyhow::Result<Self> {
        let state = ctx.new_state(&ctx.config.loading_scene)?;
        Ok(Self {
            ctx,
            state,
            link: None,
            connection: ConnectionState::Disconnected,
            client_id: ClientId::SERVER,
            frame_actions: Vec::new(),
            pending: VecDeque::new(),
            next_sequence: 1,
            future_snapshot: None,
            events: Vec::new(),
        })
    }

    /// Connects to the server named in the session config.
    pub async fn connect(&mut self) -> anyhow::Result<()> {
        if self.connection != ConnectionState::Disconnected {
            bail!("session is already {:?}", self.connection);
        }
        self.connection = ConnectionState::Connecting;
        match NetClient::connect(&self.ctx.config).await {
            Ok(link) => self.attach(link),
            Err(e) => {
                self.connection = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Adopts an already connected endpoint.
    pub fn attach(&mut self, link: NetClient) -> anyhow::Result<()> {
        let accept = link.accept_info().clone();
        self.state.switch_scene(&accept.scene_key)?;
        self.state.scene_epoch = accept.scene_epoch;
        self.client_id = accept.client_id;
        self.reset_prediction();
        self.link = Some(link);
        self.connection = ConnectionState::Connected;
        self.events.push(SessionEvent::Connected {
            client_id: accept.client_id,
        });
        info!(
            client_id = %accept.client_id,
            scene = %accept.scene_key,
            epoch = accept.scene_epoch,
            "Client session connected"
        );
        Ok(())
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn pending_actions(&self) -> impl Iterator<Item = &NetAction> {
        self.pending.iter()
    }

    pub fn has_future_snapshot(&self) -> bool {
        self.future_snapshot.is_some()
    }

    pub fn link(&self) -> Option<&NetClient> {
        self.link.as_ref()
    }

    pub fn send_chat(&self, message: &str) {
        if let Some(link) = &self.link {
            link.send_chat(message);
        }
    }

    /// Leaves the server. The Disconnected event is raised by the link.
    pub fn disconnect(&mut self, reason: &str) {
        if let Some(link) = &self.link {
            link.disconnect(reason);
        }
        self.poll_link();
    }

    fn reset_prediction(&mut self) {
        self.frame_actions.clear();
        self.pending.clear();
        self.future_snapshot = None;
    }

    /// Stamps, applies and buffers this frame's actions.
    fn predict(&mut self, actions: Vec<NetAction>) {
        self.frame_actions.clear();
        for mut action in actions {
            action.sequence = self.next_sequence;
            action.tick = self.state.tick;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            action.apply(&mut self.state, self.client_id);
            self.pending.push_back(action);
            self.frame_actions.push(action);
        }
    }

    /// Reconciles against an authoritative snapshot.
    pub fn apply_snapshot(&mut self, snap: SnapshotPacket) {
        let local = self.state.scene_epoch;
        if snap.scene_epoch < local {
            debug!(epoch = snap.scene_epoch, local, "Dropping stale snapshot");
            return;
        }
        if snap.scene_epoch > local {
            debug!(epoch = snap.scene_epoch, local, "Buffering future snapshot");
            self.future_snapshot = Some(snap);
            return;
        }

        if let Err(e) = merge_snapshot(self.state.world_mut(), &snap.world) {
            warn!(error = %e, "Snapshot merge failed");
            return;
        }
        self.state.tick = snap.tick;

        let acked = snap.last_processed_for(self.client_id).unwrap_or(0);
        self.pending.retain(|a| a.sequence > acked);
        for action in &self.pending {
            action.apply(&mut self.state, self.client_id);
        }
    }

    /// Switches to the scene of a newer epoch. Older or equal epochs are
    /// ignored.
    pub fn on_scene_change(&mut self, scene_epoch: i32, scene_key: &str) {
        if scene_epoch <= self.state.scene_epoch {
            debug!(scene_epoch, "Ignoring outdated scene change");
            return;
        }

        self.frame_actions.clear();
        self.pending.clear();
        if let Err(e) = self.state.switch_scene(scene_key) {
            warn!(error = %e, scene = scene_key, "Cannot switch to server scene");
            return;
        }
        self.state.scene_epoch = scene_epoch;
        self.events.push(SessionEvent::SceneChanged {
            scene_key: scene_key.to_string(),
            scene_epoch,
        });

        if let Some(snap) = self.future_snapshot.take() {
            self.apply_snapshot(snap);
        }
    }

    /// Drains network events into the session.
    fn poll_link(&mut self) {
        let mut disconnected = None;
        if let Some(link) = self.link.as_mut() {
            let mut incoming = Vec::new();
            while let Some(ev) = link.try_recv_event() {
                incoming.push(ev);
            }
            for ev in incoming {
                match ev {
                    ClientEvent::Chat { sender, message } => {
                        info!(%sender, %message, "Chat");
                        self.events.push(SessionEvent::Chat { sender, message });
                    }
                    ClientEvent::SceneChange {
                        scene_epoch,
                        scene_key,
                    } => self.on_scene_change(scene_epoch, &scene_key),
                    ClientEvent::Snapshot(snap) => self.apply_snapshot(snap),
                    ClientEvent::Disconnected { reason } => disconnected = Some(reason),
                }
            }
        }

        if let Some(reason) = disconnected {
            self.link = None;
            self.connection = ConnectionState::Disconnected;
            self.reset_prediction();
            self.events.push(SessionEvent::Disconnected { reason });
        }
    }
}

impl GameSession for ClientSession {
    fn kind(&self) -> SessionKind {
        SessionKind::MultiplayerClient
    }

    fn state(&self) -> &GameState {
        &self.state
    }

    fn handle_input(&mut self, actions: Vec<NetAction>) {
        if self.connection != ConnectionState::Connected || actions.is_empty() {
            return;
        }
        self.predict(actions);
        if let Some(link) = &self.link {
            link.send_actions(&self.frame_actions);
        }
    }

    fn update(&mut self, dt: f32) {
        self.poll_link();
        if self.connection != ConnectionState::Connected {
            return;
        }
        self.state.update(dt);
    }

    /// Clients follow the server's scene; local requests are refused.
    fn switch_scene(&mut self, key: &str) -> anyhow::Result<()> {
        bail!("clients cannot switch scene (requested {key:?})")
    }

    fn stop(&mut self) {
        self.disconnect("Client Stopped");
    }

    fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use engine_shared::{
        config::EngineConfig,
        ids::NetworkId,
        math::Vec2,
        object::{NetObject, ObjectKind, ObjectTree},
    };

    use super::*;

    const ME: ClientId = ClientId(1);

    /// A session that believes it is connected as client 1, without a link.
    fn offline_session() -> ClientSession {
        let mut s = ClientSession::new(SessionContext::new(EngineConfig::default())).unwrap();
        s.state.switch_scene("arena").unwrap();
        s.client_id = ME;
        s.connection = ConnectionState::Connected;
        s
    }

    fn world_with_pawn(direction: Vec2, position: Vec2) -> ObjectTree {
        let mut root = NetObject::new(ObjectKind::SceneRoot);
        root.network_id = NetworkId(1);
        let mut tree = ObjectTree::new(root);
        let mut pawn = NetObject::new(ObjectKind::Player);
        pawn.network_id = NetworkId(2);
        pawn.owner = ME;
        pawn.state.direction = direction;
        pawn.state.position = position;
        let rk = tree.root();
        tree.add_child(rk, pawn);
        tree
    }

    fn snapshot(epoch: i32, acked: u32, world: ObjectTree) -> SnapshotPacket {
        SnapshotPacket {
            scene_epoch: epoch,
            tick: 50,
            last_processed: BTreeMap::from([(ME, acked)]),
            world,
        }
    }

    fn pawn_state(s: &ClientSession) -> (Vec2, Vec2) {
        let key = s.state().pawn(ME).unwrap();
        let obj = s.state().world().get(key).unwrap();
        (obj.state.direction, obj.state.position)
    }

    fn sequences(s: &ClientSession) -> Vec<u32> {
        s.pending_actions().map(|a| a.sequence).collect()
    }

    #[test]
    fn actions_are_stamped_from_one() {
        let mut s = offline_session();
        s.handle_input(vec![
            NetAction::movement(Vec2::new(1.0, 0.0)),
            NetAction::movement(Vec2::new(0.0, 1.0)),
        ]);
        assert_eq!(sequences(&s), vec![1, 2]);
    }

    #[test]
    fn acknowledged_actions_are_dropped_and_the_rest_replayed() {
        let mut s = offline_session();
        s.apply_snapshot(snapshot(0, 0, world_with_pawn(Vec2::ZERO, Vec2::ZERO)));
        s.next_sequence = 5;
        s.handle_input(vec![NetAction::movement(Vec2::new(1.0, 0.0))]);
        s.handle_input(vec![NetAction::movement(Vec2::new(0.0, 1.0))]);
        s.handle_input(vec![NetAction::movement(Vec2::new(-1.0, 0.0))]);
        assert_eq!(sequences(&s), vec![5, 6, 7]);

        // Server applied up to 6, so its pawn faces (0, 1).
        let server_pos = Vec2::new(3.0, 4.0);
        s.apply_snapshot(snapshot(0, 6, world_with_pawn(Vec2::new(0.0, 1.0), server_pos)));

        assert_eq!(sequences(&s), vec![7]);
        assert_eq!(pawn_state(&s), (Vec2::new(-1.0, 0.0), server_pos));
        assert_eq!(s.state().tick, 50);
    }

    #[test]
    fn stale_snapshot_does_not_mutate_state() {
        let mut s = offline_session();
        s.state.scene_epoch = 2;
        let before = s.state().world().len();
        s.apply_snapshot(snapshot(1, 0, world_with_pawn(Vec2::ZERO, Vec2::ZERO)));
        assert_eq!(s.state().world().len(), before);
        assert_eq!(s.state().tick, 1);
        assert!(!s.has_future_snapshot());
    }

    #[test]
    fn failed_merge_keeps_local_tick() {
        let mut s = offline_session();
        // A player cannot stand in for the scene root.
        let mut bad_root = NetObject::new(ObjectKind::Player);
        bad_root.network_id = NetworkId(1);
        s.apply_snapshot(snapshot(0, 0, ObjectTree::new(bad_root)));
        assert_eq!(s.state().tick, 1);
    }

    #[test]
    fn future_snapshot_waits_for_scene_change() {
        let mut s = offline_session();
        s.apply_snapshot(snapshot(1, 0, world_with_pawn(Vec2::ZERO, Vec2::new(9.0, 9.0))));
        assert!(s.has_future_snapshot());
        assert!(s.state().pawn(ME).is_none());

        s.on_scene_change(1, "garden");
        assert!(!s.has_future_snapshot());
        assert_eq!(s.state().scene_key(), "garden");
        assert_eq!(s.state().scene_epoch, 1);
        assert_eq!(pawn_state(&s).1, Vec2::new(9.0, 9.0));
    }

    #[test]
    fn scene_change_clears_pending_and_ignores_old_epochs() {
        let mut s = offline_session();
        s.handle_input(vec![NetAction::movement(Vec2::new(1.0, 0.0))]);
        s.on_scene_change(0, "garden");
        assert_eq!(s.state().scene_key(), "arena");
        assert_eq!(sequences(&s), vec![1]);

        s.on_scene_change(3, "garden");
        assert!(sequences(&s).is_empty());
        assert_eq!(
            s.drain_events(),
            vec![SessionEvent::SceneChanged {
                scene_key: "garden".into(),
                scene_epoch: 3
            }]
        );
    }

    #[test]
    fn input_is_ignored_while_disconnected() {
        let mut s = ClientSession::new(SessionContext::new(EngineConfig::default())).unwrap();
        s.handle_input(vec![NetAction::movement(Vec2::new(1.0, 0.0))]);
        assert!(sequences(&s).is_empty());
        assert_eq!(s.state().scene_key(), "loading");
        assert!(s.switch_scene("arena").is_err());
    }
}
