//! Rendering abstraction.
//!
//! This crate intentionally does not depend on a graphics backend.
//! A renderer implementation receives object trees node by node.

use crate::object::{NetObject, ObjectTree};

/// A minimal rendering API.
pub trait RenderBackend {
    fn begin_frame(&mut self);
    /// Draws one object; `depth` is 0 for a tree root.
    fn draw_object(&mut self, object: &NetObject, depth: usize);
    fn end_frame(&mut self);
}

/// A no-op renderer useful for headless tests and dedicated servers.
#[derive(Debug, Default)]
pub struct NullRenderer;

impl RenderBackend for NullRenderer {
    fn begin_frame(&mut self) {}
    fn draw_object(&mut self, _object: &NetObject, _depth: usize) {}
    fn end_frame(&mut self) {}
}

/// Draws every visible object of `tree` in pre-order. Hidden objects hide
/// their subtree.
pub fn render_tree(tree: &ObjectTree, renderer: &mut dyn RenderBackend) {
    let mut stack = vec![(tree.root(), 0usize)];
    while let Some((key, depth)) = stack.pop() {
        let Some(obj) = tree.get(key) else {
            continue;
        };
        if !obj.state.visible {
            continue;
        }
        renderer.draw_object(obj, depth);
        stack.extend(tree.children(key).iter().rev().map(|c| (*c, depth + 1)));
    }
}
