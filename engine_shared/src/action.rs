//! Net actions: sequence-numbered units of client input.
//!
//! Applying an action only ever sets fields, so applying the same action
//! twice has the same effect as applying it once. This is what makes
//! replaying unacknowledged actions after a correction safe.

use crate::{
    ids::ClientId,
    math::Vec2,
    state::GameState,
    wire::{DecodeError, WireReader, WireWriter},
};

/// Minimum encoded size of one action: tag, sequence and tick.
pub const MIN_ACTION_LEN: usize = 1 + 4 + 4;

/// Closed set of action kinds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActionCommand {
    /// Sets the desired movement direction of the sender's pawn.
    Move { direction: Vec2 },
}

impl ActionCommand {
    pub fn tag(&self) -> u8 {
        match self {
            ActionCommand::Move { .. } => 0,
        }
    }
}

/// One command plus its sequencing metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetAction {
    /// Per-client, strictly increasing, starting at 1. Zero until stamped.
    pub sequence: u32,
    /// Tick the action was produced for.
    pub tick: u32,
    pub command: ActionCommand,
}

impl NetAction {
    pub fn new(command: ActionCommand) -> Self {
        Self {
            sequence: 0,
            tick: 0,
            command,
        }
    }

    pub fn movement(direction: Vec2) -> Self {
        Self::new(ActionCommand::Move { direction })
    }

    /// Applies the action on behalf of `client`. A missing pawn is a no-op.
    pub fn apply(&self, state: &mut GameState, client: ClientId) {
        match self.command {
            ActionCommand::Move { direction } => {
                if let Some(pawn) = state.pawn_mut(client) {
                    pawn.state.direction = direction;
                }
            }
        }
    }

    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u8(self.command.tag());
        w.put_u32(self.sequence);
        w.put_u32(self.tick);
        match self.command {
            ActionCommand::Move { direction } => w.put_vec2(direction),
        }
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let tag = r.u8()?;
        let sequence = r.u32()?;
        let tick = r.u32()?;
        let command = match tag {
            0 => ActionCommand::Move {
                direction: r.vec2()?,
            },
            other => return Err(DecodeError::UnknownActionType(other)),
        };
        Ok(Self {
            sequence,
            tick,
            command,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        object::{NetObject, ObjectKind},
        scene::SceneRegistry,
    };

    fn state_with_pawn(owner: ClientId) -> GameState {
        let mut state = GameState::new(Arc::new(SceneRegistry::standard()), "arena").unwrap();
        state.add_object(NetObject::new(ObjectKind::Player), None, owner);
        state
    }

    #[test]
    fn move_sets_direction_of_senders_pawn() {
        let mut state = state_with_pawn(ClientId(1));
        NetAction::movement(Vec2::new(1.0, 0.0)).apply(&mut state, ClientId(1));
        assert_eq!(
            state.pawn_mut(ClientId(1)).unwrap().state.direction,
            Vec2::new(1.0, 0.0)
        );
    }

    #[test]
    fn applying_twice_equals_applying_once() {
        let action = NetAction::movement(Vec2::new(0.0, -1.0));
        let mut once = state_with_pawn(ClientId(1));
        let mut twice = state_with_pawn(ClientId(1));

        action.apply(&mut once, ClientId(1));
        action.apply(&mut twice, ClientId(1));
        action.apply(&mut twice, ClientId(1));

        assert_eq!(
            once.pawn_mut(ClientId(1)).unwrap().state,
            twice.pawn_mut(ClientId(1)).unwrap().state
        );
    }

    #[test]
    fn missing_pawn_is_a_silent_no_op() {
        let mut state = state_with_pawn(ClientId(1));
        NetAction::movement(Vec2::new(1.0, 1.0)).apply(&mut state, ClientId(9));
        assert_eq!(
            state.pawn_mut(ClientId(1)).unwrap().state.direction,
            Vec2::ZERO
        );
    }

    #[test]
    fn wire_layout_is_tag_sequence_tick_payload() {
        let action = NetAction {
            sequence: 7,
            tick: 42,
            command: ActionCommand::Move {
                direction: Vec2::new(0.5, -0.5),
            },
        };
        let mut w = WireWriter::new();
        action.encode(&mut w);
        let bytes = w.into_vec();
        assert_eq!(bytes.len(), MIN_ACTION_LEN + 8);
        assert_eq!(bytes[0], 0);
        assert_eq!(&bytes[1..5], &7u32.to_le_bytes());

        let mut r = WireReader::new(&bytes);
        assert_eq!(NetAction::decode(&mut r).unwrap(), action);
        r.finish().unwrap();
    }

    #[test]
    fn unknown_action_tag_is_rejected() {
        let bytes = [9u8, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            NetAction::decode(&mut WireReader::new(&bytes)),
            Err(DecodeError::UnknownActionType(9))
        );
    }
}
