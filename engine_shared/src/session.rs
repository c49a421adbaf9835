//! Game sessions.
//!
//! A session wires a [`GameState`] to whatever drives it: local input only
//! (singleplayer), a remote authority (client) or a set of remote clients
//! (host). The game loop talks to every variant through [`GameSession`]
//! and drains [`SessionEvent`]s once per frame.

use std::{fmt, sync::Arc};

use tracing::info;

use crate::{
    action::NetAction,
    config::EngineConfig,
    ids::ClientId,
    object::{NetObject, ObjectKind},
    render::{render_tree, RenderBackend},
    scene::{SceneFactory, SceneRegistry},
    state::GameState,
};

/// Which session variant is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKind {
    #[default]
    None,
    Singleplayer,
    MultiplayerClient,
    MultiplayerHost,
}

/// Notifications a session raises for the game.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected { client_id: ClientId },
    Disconnected { reason: String },
    Chat { sender: String, message: String },
    SceneChanged { scene_key: String, scene_epoch: i32 },
    ClientJoined { client_id: ClientId, name: String },
    ClientLeft { client_id: ClientId },
}

/// Common surface of every session variant.
pub trait GameSession: Send {
    fn kind(&self) -> SessionKind;

    fn state(&self) -> &GameState;

    /// Queues this frame's local actions.
    fn handle_input(&mut self, actions: Vec<NetAction>);

    /// Advances the session by `dt` seconds.
    fn update(&mut self, dt: f32);

    fn switch_scene(&mut self, key: &str) -> anyhow::Result<()>;

    /// Tears the session down. Idempotent.
    fn stop(&mut self);

    fn drain_events(&mut self) -> Vec<SessionEvent>;

    /// Draws the world tree, then the UI tree.
    fn render(&self, renderer: &mut dyn RenderBackend) {
        let scene = self.state().scene();
        renderer.begin_frame();
        render_tree(&scene.world, renderer);
        render_tree(&scene.ui, renderer);
        renderer.end_frame();
    }
}

/// Builds the local player's pawn.
pub type PlayerFactory = Arc<dyn Fn() -> NetObject + Send + Sync>;

/// Everything a session needs from the process, passed explicitly.
#[derive(Clone)]
pub struct SessionContext {
    pub config: EngineConfig,
    pub scenes: Arc<dyn SceneFactory>,
    pub player_factory: PlayerFactory,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Context with the standard scenes and a player named after the config.
    pub fn new(config: EngineConfig) -> Self {
        let name = config.player_name.clone();
        Self {
            config,
            scenes: Arc::new(SceneRegistry::standard()),
            player_factory: Arc::new(move || {
                let mut player = NetObject::new(ObjectKind::Player);
                player.state.name = name.clone();
                player
            }),
        }
    }

    pub fn spawn_player(&self) -> NetObject {
        (self.player_factory)()
    }

    pub fn new_state(&self, scene_key: &str) -> anyhow::Result<GameState> {
        GameState::new(self.scenes.clone(), scene_key)
    }
}

/// Local-only session: the player's input is applied directly.
pub struct SingleplayerSession {
    ctx: SessionContext,
    state: GameState,
    frame_actions: Vec<NetAction>,
    events: Vec<SessionEvent>,
    stopped: bool,
}

impl SingleplayerSession {
    pub fn start(ctx: SessionContext) -> anyhow::Result<Self> {
        let state = ctx.new_state(&ctx.config.start_scene)?;
        let mut session = Self {
            ctx,
            state,
            frame_actions: Vec::new(),
            events: Vec::new(),
            stopped: false,
        };
        session.populate();
        info!(scene = session.state.scene_key(), "Singleplayer session started");
        Ok(session)
    }

    fn populate(&mut self) {
        self.state.register_existing_objects();
        let player = self.ctx.spawn_player();
        self.state.add_object(player, None, ClientId::LOCAL);
    }
}

impl GameSession for SingleplayerSession {
    fn kind(&self) -> SessionKind {
        SessionKind::Singleplayer
    }

    fn state(&self) -> &GameState {
        &self.state
    }

    fn handle_input(&mut self, actions: Vec<NetAction>) {
        if self.stopped {
            return;
        }
        self.frame_actions = actions;
    }

    fn update(&mut self, dt: f32) {
        if self.stopped {
            return;
        }
        for action in std::mem::take(&mut self.frame_actions) {
            action.apply(&mut self.state, ClientId::LOCAL);
        }
        self.state.update(dt);
    }

    fn switch_scene(&mut self, key: &str) -> anyhow::Result<()> {
        self.state.switch_scene(key)?;
        self.state.scene_epoch += 1;
        self.populate();
        self.events.push(SessionEvent::SceneChanged {
            scene_key: key.to_string(),
            scene_epoch: self.state.scene_epoch,
        });
        Ok(())
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.frame_actions.clear();
    }

    fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }
}
