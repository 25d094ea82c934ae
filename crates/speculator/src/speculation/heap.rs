//! Shared heap for speculative execution
//!
//! The heap holds the live ("committed") value of every location the program
//! touches. Speculative tasks never write here directly: their writes sit in
//! their transaction until commit. Non-speculative code (the holder of the
//! commit token) reads and writes the heap directly.
//!
//! # Key Features
//!
//! - **Concurrent access**: fine-grained sharded map, readers never block writers
//! - **Shapes**: objects and arrays are registered at allocation so accesses can be bounds-checked
//! - **Commit lock**: serializes validate+writeback of committing transactions

use crate::{
    error::Fault,
    speculation::types::{Location, ObjectId, Value, ValueKind},
};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

/// Layout of an allocated heap entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Object { fields: u32 },
    Array { kind: ValueKind, len: u32 },
}

#[derive(Debug)]
pub struct Heap {
    cells: DashMap<Location, Value>,
    shapes: DashMap<ObjectId, Shape>,
    next_object: AtomicU64,
    commit_lock: Mutex<()>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
            shapes: DashMap::new(),
            next_object: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
        }
    }

    /// Allocate an object with `fields` zero-initialized fields.
    pub fn alloc_object(&self, fields: u32) -> ObjectId {
        let id = ObjectId(self.next_object.fetch_add(1, Ordering::Relaxed));
        self.shapes.insert(id, Shape::Object { fields });
        id
    }

    /// Allocate a zero-initialized array.
    pub fn alloc_array(&self, kind: ValueKind, len: u32) -> ObjectId {
        let id = ObjectId(self.next_object.fetch_add(1, Ordering::Relaxed));
        self.shapes.insert(id, Shape::Array { kind, len });
        id
    }

    pub fn shape(&self, id: ObjectId) -> Option<Shape> {
        self.shapes.get(&id).map(|shape| *shape)
    }

    pub fn array_len(&self, id: ObjectId) -> Option<u32> {
        match self.shape(id)? {
            Shape::Array { len, .. } => Some(len),
            Shape::Object { .. } => None,
        }
    }

    /// Check that `location` names an existing field or an in-bounds element.
    pub fn check(&self, location: &Location) -> Result<(), Fault> {
        match *location {
            Location::Field { object, offset } => match self.shape(object) {
                Some(Shape::Object { fields }) if offset < fields => Ok(()),
                Some(_) => Err(Fault::Fatal(format!("{} is not a field of {}", location, object))),
                None => Err(Fault::DanglingReference(object)),
            },
            Location::Element { array, index } => match self.shape(array) {
                Some(Shape::Array { len, .. }) if index < len => Ok(()),
                Some(Shape::Array { len, .. }) => Err(Fault::IndexOutOfBounds { array, index, len }),
                Some(Shape::Object { .. }) => {
                    Err(Fault::Fatal(format!("{} is not an array", array)))
                }
                None => Err(Fault::DanglingReference(array)),
            },
        }
    }

    /// Current committed value at `location`; unwritten locations hold the zero of `kind`.
    pub fn load(&self, location: &Location, kind: ValueKind) -> Value {
        self.cells
            .get(location)
            .map(|value| *value)
            .unwrap_or_else(|| kind.zero())
    }

    /// Raw lookup: `None` for a never-written location.
    pub fn peek(&self, location: &Location) -> Option<Value> {
        self.cells.get(location).map(|value| *value)
    }

    pub fn store(&self, location: Location, value: Value) {
        self.cells.insert(location, value);
    }

    /// Serializes commits: validation and write-back happen under this guard.
    pub fn commit_guard(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Copy of every written location.
    pub fn snapshot(&self) -> HashMap<Location, Value> {
        self.cells
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }
}
