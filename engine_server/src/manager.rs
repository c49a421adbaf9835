//! Session manager: owns the one active session of the process.

use anyhow::bail;
use engine_client::session::ClientSession;
use engine_shared::{
    action::NetAction,
    render::RenderBackend,
    session::{GameSession, SessionContext, SessionEvent, SessionKind, SingleplayerSession},
};
use tracing::info;

use crate::host::HostSession;

/// Holds at most one session. Switching always stops and drops the previous
/// session before the next one starts, so sockets are released first.
pub struct SessionManager {
    ctx: SessionContext,
    session: Option<Box<dyn GameSession>>,
    kind: SessionKind,
}

impl SessionManager {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            session: None,
            kind: SessionKind::None,
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn session(&self) -> Option<&dyn GameSession> {
        self.session.as_deref()
    }

    pub fn session_mut(&mut self) -> Option<&mut (dyn GameSession + 'static)> {
        self.session.as_deref_mut()
    }

    pub fn switch_to_singleplayer(&mut self) -> anyhow::Result<()> {
        let ctx = self.take_previous();
        let session = SingleplayerSession::start(ctx)?;
        self.install(Box::new(session), SessionKind::Singleplayer);
        Ok(())
    }

    /// Connects to `host:port` as a client. The server decides the scene.
    pub async fn switch_to_client(&mut self, host: &str, port: u16) -> anyhow::Result<()> {
        self.shutdown();
        let mut ctx = self.ctx.clone();
        ctx.config.host = host.to_string();
        ctx.config.tcp_port = port;

        let mut session = ClientSession::new(ctx)?;
        session.connect().await?;
        self.install(Box::new(session), SessionKind::MultiplayerClient);
        Ok(())
    }

    pub async fn switch_to_host(&mut self, local_player: bool) -> anyhow::Result<()> {
        let ctx = self.take_previous();
        let session = HostSession::start(ctx, local_player).await?;
        self.install(Box::new(session), SessionKind::MultiplayerHost);
        Ok(())
    }

    /// Stops and drops the active session, if any.
    pub fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stop();
            info!(kind = ?self.kind, "Session stopped");
        }
        self.kind = SessionKind::None;
    }

    pub fn handle_input(&mut self, actions: Vec<NetAction>) {
        if let Some(s) = self.session.as_mut() {
            s.handle_input(actions);
        }
    }

    pub fn update(&mut self, dt: f32) {
        if let Some(s) = self.session.as_mut() {
            s.update(dt);
        }
    }

    pub fn render(&self, renderer: &mut dyn RenderBackend) {
        if let Some(s) = self.session.as_ref() {
            s.render(renderer);
        }
    }

    pub fn switch_scene(&mut self, key: &str) -> anyhow::Result<()> {
        match self.session.as_mut() {
            Some(s) => s.switch_scene(key),
            None => bail!("no active session"),
        }
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.session
            .as_mut()
            .map(|s| s.drain_events())
            .unwrap_or_default()
    }

    /// Stops the current session and returns a context that starts where
    /// it left off. A client's scene belongs to its server and is not kept.
    fn take_previous(&mut self) -> SessionContext {
        let mut ctx = self.ctx.clone();
        if self.kind != SessionKind::MultiplayerClient {
            if let Some(s) = self.session.as_ref() {
                ctx.config.start_scene = s.state().scene_key().to_string();
            }
        }
        self.shutdown();
        ctx
    }

    fn install(&mut self, session: Box<dyn GameSession>, kind: SessionKind) {
        info!(?kind, scene = session.state().scene_key(), "Session started");
        self.session = Some(session);
        self.kind = kind;
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
