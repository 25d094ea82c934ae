//! Optimistic transaction for one speculative task
//!
//! A transaction buffers every write of its task and records every read it
//! served from the live heap. Nothing becomes visible to other tasks until
//! `commit`, which re-checks each recorded read against the heap and only
//! then writes the buffered values back.
//!
//! # How It Works
//!
//! 1. A read first consults the write-set (the task sees its own writes)
//! 2. Otherwise the live value is returned and recorded in the read-set
//! 3. Writes replace any earlier write to the same location
//! 4. Commit = validate the read-set, then apply the write-set, under the heap commit lock
//!
//! Validation is value based: a read is stale iff the live value differs
//! from what was observed, so commit cost grows with the read-set.

use crate::speculation::{
    access::MemoryAccessRecord,
    heap::Heap,
    types::{Location, TaskId, Value, ValueKind},
};
use std::collections::HashMap;
use tracing::trace;

pub type ReadSet = HashMap<Location, MemoryAccessRecord>;

pub type WriteSet = HashMap<Location, MemoryAccessRecord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// Validation result with conflict details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    /// A recorded read no longer matches the heap
    Conflict {
        location: Location,
        expected: Value,
        actual: Value,
    },
    /// The same location was observed with two different values during execution
    Inconsistent { location: Location },
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

#[derive(Debug)]
pub struct Transaction {
    owner: TaskId,
    state: TxnState,
    read_set: ReadSet,
    write_set: WriteSet,
    /// First location seen with two different live values, if any
    inconsistent: Option<Location>,
}

impl Transaction {
    pub fn new(owner: TaskId) -> Self {
        Self {
            owner,
            state: TxnState::Active,
            read_set: ReadSet::new(),
            write_set: WriteSet::new(),
            inconsistent: None,
        }
    }

    pub fn owner(&self) -> TaskId {
        self.owner
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn read_set_len(&self) -> usize {
        self.read_set.len()
    }

    pub fn write_set_len(&self) -> usize {
        self.write_set.len()
    }

    /// Buffered value for `location`, if this transaction wrote it.
    pub fn buffered(&self, location: &Location) -> Option<Value> {
        self.write_set.get(location).map(MemoryAccessRecord::value)
    }

    /// Serve a read. `live` is the heap value at the time of the read.
    pub fn read(&mut self, location: Location, kind: ValueKind, live: Value) -> Value {
        if let Some(value) = self.buffered(&location) {
            return value;
        }
        match self.read_set.get(&location) {
            Some(previous) if previous.value() != live => {
                // Two different live values in one execution: no sequential
                // schedule could have produced both.
                self.inconsistent.get_or_insert(location);
            }
            Some(_) => {}
            None => {
                self.read_set
                    .insert(location, MemoryAccessRecord::new(location, kind, live));
            }
        }
        live
    }

    pub fn write(&mut self, location: Location, value: Value) {
        self.write_set.insert(
            location,
            MemoryAccessRecord::new(location, value.kind(), value),
        );
    }

    pub fn validate(&self, heap: &Heap) -> bool {
        self.validate_detailed(heap).is_valid()
    }

    /// Validate the read-set and return the first conflict found.
    pub fn validate_detailed(&self, heap: &Heap) -> ValidationResult {
        if let Some(location) = self.inconsistent {
            return ValidationResult::Inconsistent { location };
        }
        for record in self.read_set.values() {
            if !record.validate(heap) {
                return ValidationResult::Conflict {
                    location: record.location(),
                    expected: record.value(),
                    actual: heap.load(&record.location(), record.kind()),
                };
            }
        }
        ValidationResult::Valid
    }

    /// Validate and, if valid, publish every buffered write.
    ///
    /// The caller must already have unbound this transaction from its
    /// execution context. On failure the heap is left untouched and the
    /// transaction is aborted.
    pub fn commit(&mut self, heap: &Heap) -> ValidationResult {
        debug_assert_eq!(self.state, TxnState::Active, "commit of a finished transaction");
        let result = {
            let _guard = heap.commit_guard();
            let result = self.validate_detailed(heap);
            if result.is_valid() {
                for record in self.write_set.values() {
                    record.writeback(heap);
                }
            }
            result
        };

        if result.is_valid() {
            trace!(
                target: "speculation",
                task_id = %self.owner,
                reads = self.read_set.len(),
                writes = self.write_set.len(),
                "Transaction committed"
            );
            self.state = TxnState::Committed;
            self.read_set.clear();
            self.write_set.clear();
        } else {
            self.abort();
        }
        result
    }

    /// Drop all buffered state. Never touches the heap.
    pub fn abort(&mut self) {
        self.state = TxnState::Aborted;
        self.read_set.clear();
        self.write_set.clear();
        self.inconsistent = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    fn setup() -> (Heap, Location, Location) {
        let heap = Heap::new();
        let obj = heap.alloc_object(2);
        (heap, Location::field(obj, 0), Location::field(obj, 1))
    }

    #[test]
    fn test_read_own_write() {
        let (heap, a, _) = setup();
        let mut txn = Transaction::new(TaskId(1));
        txn.write(a, Value::Int(7));
        let live = heap.load(&a, ValueKind::Int);
        assert_eq!(txn.read(a, ValueKind::Int, live), Value::Int(7));
        // Reads served by the write-set are not recorded
        assert_eq!(txn.read_set_len(), 0);
    }

    #[test]
    fn test_writes_invisible_until_commit() {
        let (heap, a, _) = setup();
        let mut txn = Transaction::new(TaskId(1));
        txn.write(a, Value::Int(7));
        assert_eq!(heap.load(&a, ValueKind::Int), Value::Int(0));

        assert!(txn.commit(&heap).is_valid());
        assert_eq!(txn.state(), TxnState::Committed);
        assert_eq!(heap.load(&a, ValueKind::Int), Value::Int(7));
    }

    #[test]
    fn test_last_write_wins() {
        let (heap, a, _) = setup();
        let mut txn = Transaction::new(TaskId(1));
        txn.write(a, Value::Int(1));
        txn.write(a, Value::Int(2));
        assert_eq!(txn.write_set_len(), 1);
        txn.commit(&heap);
        assert_eq!(heap.load(&a, ValueKind::Int), Value::Int(2));
    }

    #[test]
    fn test_stale_read_fails_commit_and_leaves_heap_untouched() {
        let (heap, a, b) = setup();
        let mut txn = Transaction::new(TaskId(2));
        let live = heap.load(&a, ValueKind::Int);
        txn.read(a, ValueKind::Int, live);
        txn.write(b, Value::Int(99));

        // A predecessor commits a new value for `a`
        heap.store(a, Value::Int(5));

        let result = txn.commit(&heap);
        assert_eq!(
            result,
            ValidationResult::Conflict {
                location: a,
                expected: Value::Int(0),
                actual: Value::Int(5),
            }
        );
        assert_eq!(txn.state(), TxnState::Aborted);
        assert_eq!(heap.load(&b, ValueKind::Int), Value::Int(0));
    }

    #[test]
    fn test_inconsistent_reads_never_validate() {
        let (heap, a, _) = setup();
        let mut txn = Transaction::new(TaskId(3));
        txn.read(a, ValueKind::Int, Value::Int(0));
        heap.store(a, Value::Int(1));
        txn.read(a, ValueKind::Int, Value::Int(1));
        // Live value now matches the second read, but the first one was different
        assert_eq!(
            txn.validate_detailed(&heap),
            ValidationResult::Inconsistent { location: a }
        );
    }

    #[test]
    fn test_abort_discards_everything() {
        let (heap, a, _) = setup();
        let mut txn = Transaction::new(TaskId(1));
        txn.write(a, Value::Int(3));
        txn.abort();
        assert_eq!(txn.state(), TxnState::Aborted);
        assert_eq!(txn.write_set_len(), 0);
        assert_eq!(heap.load(&a, ValueKind::Int), Value::Int(0));
    }

    #[test]
    fn stress_test_disjoint_transactions_all_commit() {
        // Every interleaving of transactions writing disjoint locations commits
        let heap = Arc::new(Heap::new());
        let arr = heap.alloc_array(ValueKind::Int, 32);

        let handles: Vec<_> = (0..32u32)
            .map(|i| {
                let heap = Arc::clone(&heap);
                thread::spawn(move || {
                    let mut txn = Transaction::new(TaskId(i as u64 + 1));
                    let loc = Location::element(arr, i);
                    let live = heap.load(&loc, ValueKind::Int);
                    let seen = txn.read(loc, ValueKind::Int, live);
                    txn.write(loc, Value::Int(seen.as_int().unwrap() + i as i32));
                    thread::yield_now();
                    txn.commit(&heap).is_valid()
                })
            })
            .collect();

        for h in handles {
            assert!(h.join().unwrap(), "disjoint transaction failed to commit");
        }
        for i in 0..32u32 {
            assert_eq!(
                heap.load(&Location::element(arr, i), ValueKind::Int),
                Value::Int(i as i32)
            );
        }
    }
}
