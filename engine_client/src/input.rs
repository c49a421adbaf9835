//! Input handling.
//!
//! In a real game this would integrate with windowing and key bindings.
//! Here an [`InputSource`] is anything that can produce the actions of one
//! frame; [`InputState`] is the simplest one, a held movement direction.

use engine_shared::{action::NetAction, math::Vec2};

/// Produces the net actions of one input frame.
pub trait InputSource {
    fn poll_actions(&mut self) -> Vec<NetAction>;
}

/// Desired movement at a moment in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    pub direction: Vec2,
}

impl InputState {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            direction: Vec2::new(x, y),
        }
    }
}

impl InputSource for InputState {
    fn poll_actions(&mut self) -> Vec<NetAction> {
        build_actions(*self)
    }
}

/// Turns sampled input into the frame's actions: one Move with the
/// normalized direction.
pub fn build_actions(input: InputState) -> Vec<NetAction> {
    vec![NetAction::movement(input.direction.normalized())]
}

#[cfg(test)]
mod tests {
    use engine_shared::action::ActionCommand;

    use super::*;

    #[test]
    fn one_normalized_move_per_frame() {
        let mut input = InputState::new(3.0, 4.0);
        let actions = input.poll_actions();
        assert_eq!(actions.len(), 1);
        match actions[0].command {
            ActionCommand::Move { direction } => {
                assert!((direction.x - 0.6).abs() < 1e-6);
                assert!((direction.y - 0.8).abs() < 1e-6);
            }
        }
        assert_eq!(actions[0].sequence, 0);
    }

    #[test]
    fn idle_input_moves_nowhere() {
        let actions = build_actions(InputState::default());
        assert_eq!(actions[0].command, ActionCommand::Move { direction: Vec2::ZERO });
    }
}
