use crate::speculation::{
    heap::Heap,
    types::{Location, Value, ValueKind},
};

/// A single tracked read or write of one heap location.
///
/// For a read, `value` is what the transaction observed and `validate` checks
/// it against the live heap. For a write, `value` is what `writeback`
/// publishes at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccessRecord {
    location: Location,
    kind: ValueKind,
    value: Value,
}

impl MemoryAccessRecord {
    pub fn new(location: Location, kind: ValueKind, value: Value) -> Self {
        Self {
            location,
            kind,
            value,
        }
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn value(&self) -> Value {
        self.value
    }

    /// True iff the live value still equals the recorded snapshot.
    pub fn validate(&self, heap: &Heap) -> bool {
        heap.load(&self.location, self.kind) == self.value
    }

    pub fn writeback(&self, heap: &Heap) {
        heap.store(self.location, self.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_tracks_live_value() {
        let heap = Heap::new();
        let obj = heap.alloc_object(1);
        let loc = Location::field(obj, 0);

        let read = MemoryAccessRecord::new(loc, ValueKind::Int, Value::Int(0));
        assert!(read.validate(&heap));

        heap.store(loc, Value::Int(5));
        assert!(!read.validate(&heap));

        MemoryAccessRecord::new(loc, ValueKind::Int, Value::Int(0)).writeback(&heap);
        assert!(read.validate(&heap));
    }
}
