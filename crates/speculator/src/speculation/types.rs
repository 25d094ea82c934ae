//! Core types for the speculative execution engine.
//!
//! This module defines the fundamental types shared by every layer:
//! - Task identity and lifecycle states
//! - Heap locations and the values stored in them
//! - Worker states sampled by the watchdog

use derive_more::Display;
use std::fmt;

/// Unique, never-reused identifier of a task in the speculation tree.
///
/// `TaskId::ROOT` is the program-order task driven by `Engine::run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("task#{_0}")]
pub struct TaskId(pub u64);

impl TaskId {
    pub const ROOT: TaskId = TaskId(0);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

/// Opaque handle of an object or array allocated on the shared heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("obj#{_0}")]
pub struct ObjectId(pub u64);

/// A single memory location the program can read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    /// Instance field: the owning object plus the field offset
    Field { object: ObjectId, offset: u32 },
    /// Array element: the array plus the element index
    Element { array: ObjectId, index: u32 },
}

impl Location {
    pub fn field(object: ObjectId, offset: u32) -> Self {
        Location::Field { object, offset }
    }

    pub fn element(array: ObjectId, index: u32) -> Self {
        Location::Element { array, index }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Field { object, offset } => write!(f, "{}.+{}", object, offset),
            Location::Element { array, index } => write!(f, "{}[{}]", array, index),
        }
    }
}

/// Kind of value a read expects to find at a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ValueKind {
    Bool,
    Int,
    Long,
    Float,
    Double,
    Ref,
}

impl ValueKind {
    /// The value an unwritten location of this kind holds.
    pub fn zero(self) -> Value {
        match self {
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Int => Value::Int(0),
            ValueKind::Long => Value::Long(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Double => Value::Double(0.0),
            ValueKind::Ref => Value::Null,
        }
    }
}

/// A value stored in the shared heap.
#[derive(Debug, Clone, Copy, Display)]
pub enum Value {
    #[display("null")]
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Ref(ObjectId),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null | Value::Ref(_) => ValueKind::Ref,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Long(_) => ValueKind::Long,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }
}

// Floating point values compare by bit pattern: validation must tell a stale
// NaN or a -0.0 apart from the live value exactly as the heap stores it.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Ref(a), Value::Ref(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

/// Lifecycle of a task in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Submitted to the pool, not yet picked up by a worker
    Queued,
    /// Executing its computation on a worker
    Running,
    /// Blocked mid-computation at a suspension point, waiting for the commit token
    FrozenMidFlight,
    /// Computation done, only the validate/commit/publish epilogue remains
    FrozenFinished,
    /// Result published; terminal for scheduling purposes
    Done,
}

/// Outcome of trying to commit a task's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    /// Still speculative, commit not attempted yet
    Pending,
    /// Read-set validated and writes applied
    Committed,
    /// Validation failed, writes discarded
    Invalidated,
    /// An ancestor forced this task to abort
    ForcedAbort,
}

/// Relation of a task to the child currently in its child slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildLink {
    /// The task spawned this child itself
    Spawned,
    /// The child was handed down from an ancestor that still owns it
    Inherited,
}

/// Worker state sampled by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Running = 1,
    Blocked = 2,
}

impl WorkerState {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerState::Idle,
            1 => WorkerState::Running,
            _ => WorkerState::Blocked,
        }
    }
}
