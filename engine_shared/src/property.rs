//! Replicated properties.
//!
//! A [`ReplicatedProperty`] is a named accessor pair into a field of its
//! owner's state plus the last value it observed. Dirty tracking is sampling
//! based: [`NetProperty::update_dirty`] compares the current field value with
//! the last observed one, and [`NetProperty::clear_dirty`] resets the flag
//! after a snapshot has been sent.

use std::fmt;

use crate::{
    math::Vec2,
    wire::{DecodeError, WireReader, WireWriter},
};

/// Value types a property may carry on the wire.
pub trait PropertyValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    fn encode(&self, w: &mut WireWriter);
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError>;
}

impl PropertyValue for bool {
    fn encode(&self, w: &mut WireWriter) {
        w.put_bool(*self);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.bool()
    }
}

impl PropertyValue for i32 {
    fn encode(&self, w: &mut WireWriter) {
        w.put_i32(*self);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.i32()
    }
}

impl PropertyValue for f32 {
    fn encode(&self, w: &mut WireWriter) {
        w.put_f32(*self);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.f32()
    }
}

impl PropertyValue for String {
    fn encode(&self, w: &mut WireWriter) {
        w.put_str(self);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.string()
    }
}

impl PropertyValue for Vec2 {
    fn encode(&self, w: &mut WireWriter) {
        w.put_vec2(*self);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.vec2()
    }
}

/// Type-erased view of a property bound to owner state `S`.
pub trait NetProperty<S>: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_dirty(&self) -> bool;
    fn update_dirty(&mut self, owner: &S);
    fn clear_dirty(&mut self);
    /// Writes the current field value (not the last observed one).
    fn encode(&self, owner: &S, w: &mut WireWriter);
    /// Reads a value, stores it into the field and records it as observed.
    fn decode(&mut self, owner: &mut S, r: &mut WireReader<'_>) -> Result<(), DecodeError>;
    fn boxed_clone(&self) -> Box<dyn NetProperty<S>>;
}

/// A single replicated field of `S` with value type `T`.
pub struct ReplicatedProperty<S, T: PropertyValue> {
    name: &'static str,
    get: fn(&S) -> T,
    set: fn(&mut S, T),
    last: T,
    dirty: bool,
}

impl<S, T: PropertyValue> ReplicatedProperty<S, T> {
    /// Binds a property and samples its initial value.
    pub fn new(name: &'static str, owner: &S, get: fn(&S) -> T, set: fn(&mut S, T)) -> Self {
        Self {
            name,
            get,
            set,
            last: get(owner),
            dirty: false,
        }
    }

    pub fn last_value(&self) -> &T {
        &self.last
    }
}

impl<S, T: PropertyValue> Clone for ReplicatedProperty<S, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            get: self.get,
            set: self.set,
            last: self.last.clone(),
            dirty: self.dirty,
        }
    }
}

impl<S, T: PropertyValue> fmt::Debug for ReplicatedProperty<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedProperty")
            .field("name", &self.name)
            .field("last", &self.last)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl<S: 'static, T: PropertyValue> NetProperty<S> for ReplicatedProperty<S, T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn update_dirty(&mut self, owner: &S) {
        let current = (self.get)(owner);
        if current != self.last {
            self.last = current;
            self.dirty = true;
        }
    }

    fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    fn encode(&self, owner: &S, w: &mut WireWriter) {
        (self.get)(owner).encode(w);
    }

    fn decode(&mut self, owner: &mut S, r: &mut WireReader<'_>) -> Result<(), DecodeError> {
        let value = T::decode(r)?;
        (self.set)(owner, value.clone());
        self.last = value;
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn NetProperty<S>> {
        Box::new(self.clone())
    }
}

impl<S: 'static> Clone for Box<dyn NetProperty<S>> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

impl<S> fmt::Debug for dyn NetProperty<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetProperty")
            .field("name", &self.name())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Owner {
        hp: i32,
        label: String,
    }

    fn hp(owner: &Owner) -> ReplicatedProperty<Owner, i32> {
        ReplicatedProperty::new("Hp", owner, |o| o.hp, |o, v| o.hp = v)
    }

    #[test]
    fn new_property_is_clean() {
        let owner = Owner { hp: 10, ..Default::default() };
        let p = hp(&owner);
        assert!(!p.is_dirty());
        assert_eq!(*p.last_value(), 10);
    }

    #[test]
    fn change_is_seen_as_dirty_until_cleared() {
        let mut owner = Owner::default();
        let mut p = hp(&owner);

        owner.hp = 5;
        p.update_dirty(&owner);
        assert!(p.is_dirty());

        // Still dirty on a second sample with no further change.
        p.update_dirty(&owner);
        assert!(p.is_dirty());

        p.clear_dirty();
        p.update_dirty(&owner);
        assert!(!p.is_dirty());
    }

    #[test]
    fn change_and_revert_between_samples_is_not_dirty() {
        let mut owner = Owner::default();
        let mut p = hp(&owner);

        owner.hp = 99;
        owner.hp = 0;
        p.update_dirty(&owner);
        assert!(!p.is_dirty());
    }

    #[test]
    fn decode_writes_through_the_setter() {
        let src = Owner {
            label: "crate".into(),
            ..Default::default()
        };
        let label = |o: &Owner| -> ReplicatedProperty<Owner, String> {
            ReplicatedProperty::new("Label", o, |o| o.label.clone(), |o, v| o.label = v)
        };

        let mut w = WireWriter::new();
        label(&src).encode(&src, &mut w);
        let bytes = w.into_vec();

        let mut dst = Owner::default();
        let mut p = label(&dst);
        p.decode(&mut dst, &mut WireReader::new(&bytes)).unwrap();
        assert_eq!(dst.label, "crate");
        assert_eq!(p.last_value(), "crate");
        assert!(!p.is_dirty());
    }
}
