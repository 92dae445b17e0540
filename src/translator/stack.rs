use std::collections::BTreeSet;

use crate::error::TranslateError;
use crate::ir::Slot;
use crate::wasm::{ValKind, Value};

type StackResult<T> = std::result::Result<T, TranslateError>;

#[derive(Debug, Clone, Copy)]
struct Entry {
    kind: ValKind,
    /// Known value of an `i32.const` that has not been consumed yet.
    constant: Option<i32>,
}

/// Simulated operand stack of one function.
///
/// Position `n` on the stack is always stored in slot `s{n}_{kind}`; pops
/// below `floor` (the entry height of the innermost control frame) fail.
#[derive(Debug)]
pub(super) struct ValueStack {
    entries: Vec<Entry>,
    floor: usize,
    func: u32,
    offset: usize,
    slots: BTreeSet<Slot>,
}

impl ValueStack {
    pub fn new(func: u32) -> ValueStack {
        ValueStack {
            entries: Vec::new(),
            floor: 0,
            func,
            offset: 0,
            slots: BTreeSet::new(),
        }
    }

    /// Sets the byte offset reported by subsequent failures.
    pub fn at(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub fn height(&self) -> usize {
        self.entries.len()
    }

    pub fn set_floor(&mut self, floor: usize) {
        self.floor = floor;
    }

    pub fn push(&mut self, kind: ValKind) -> Slot {
        self.push_entry(Entry {
            kind,
            constant: None,
        })
    }

    pub fn push_const(&mut self, value: Value) -> Slot {
        let constant = match value {
            Value::I32(value) => Some(value),
            _ => None,
        };
        self.push_entry(Entry {
            kind: value.kind(),
            constant,
        })
    }

    fn push_entry(&mut self, entry: Entry) -> Slot {
        let slot = Slot {
            depth: self.entries.len() as u32,
            kind: entry.kind,
        };
        self.entries.push(entry);
        self.slots.insert(slot);
        slot
    }

    pub fn pop(&mut self, kind: ValKind) -> StackResult<Slot> {
        Ok(self.pop_constant(kind)?.0)
    }

    /// Pops a value along with its constant, if it came straight from `i32.const`.
    pub fn pop_constant(&mut self, kind: ValKind) -> StackResult<(Slot, Option<i32>)> {
        self.check(&[kind])?;
        let depth = self.entries.len() - 1;
        let entry = self.entries.remove(depth);
        Ok((
            Slot {
                depth: depth as u32,
                kind,
            },
            entry.constant,
        ))
    }

    pub fn pop_any(&mut self) -> StackResult<Slot> {
        if self.entries.len() <= self.floor {
            return Err(self.imbalance("expected an operand but the stack is empty".to_string()));
        }
        let depth = self.entries.len() - 1;
        let entry = self.entries.remove(depth);
        Ok(Slot {
            depth: depth as u32,
            kind: entry.kind,
        })
    }

    /// Pops operands of the given kinds; `kinds[0]` is the deepest one.
    pub fn pop_many(&mut self, kinds: &[ValKind]) -> StackResult<Vec<Slot>> {
        let slots = self.peek(kinds)?;
        self.entries.truncate(self.entries.len() - kinds.len());
        Ok(slots)
    }

    /// Pops `params` and pushes `result`, the effect of a numeric or memory instruction.
    pub fn apply(&mut self, params: &[ValKind], result: ValKind) -> StackResult<(Vec<Slot>, Slot)> {
        let args = self.pop_many(params)?;
        Ok((args, self.push(result)))
    }

    /// The topmost slots, which must hold exactly `kinds` in order.
    pub fn peek(&self, kinds: &[ValKind]) -> StackResult<Vec<Slot>> {
        self.check(kinds)?;
        let base = self.entries.len() - kinds.len();
        Ok(kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| Slot {
                depth: (base + i) as u32,
                kind: *kind,
            })
            .collect())
    }

    /// Checks that the stack holds exactly `kinds` above `height`.
    pub fn expect_exact(&self, height: usize, kinds: &[ValKind]) -> StackResult<()> {
        if self.entries.len() != height + kinds.len() {
            return Err(self.imbalance(format!(
                "expected {} values at the end of the block but found {}",
                kinds.len(),
                self.entries.len().saturating_sub(height)
            )));
        }
        self.check(kinds)
    }

    pub fn truncate(&mut self, height: usize) {
        self.entries.truncate(height);
    }

    /// Replaces everything above `height` with fresh values of `kinds`.
    pub fn reset(&mut self, height: usize, kinds: &[ValKind]) {
        self.entries.truncate(height);
        for kind in kinds {
            self.push(*kind);
        }
    }

    /// Drops known constants at or above `height`, whose slots a branch may rewrite.
    pub fn forget_constants(&mut self, height: usize) {
        for entry in self.entries.iter_mut().skip(height) {
            entry.constant = None;
        }
    }

    pub fn record(&mut self, slot: Slot) {
        self.slots.insert(slot);
    }

    pub fn into_slots(self) -> BTreeSet<Slot> {
        self.slots
    }

    fn check(&self, kinds: &[ValKind]) -> StackResult<()> {
        let available = self.entries.len().saturating_sub(self.floor);
        if available < kinds.len() {
            return Err(self.imbalance(format!(
                "expected {} operands but only {available} available",
                kinds.len()
            )));
        }
        let base = self.entries.len() - kinds.len();
        for (i, kind) in kinds.iter().enumerate() {
            let found = self.entries[base + i].kind;
            if found != *kind {
                return Err(self.imbalance(format!(
                    "expected {kind} at depth {} but found {found}",
                    base + i
                )));
            }
        }
        Ok(())
    }

    pub fn imbalance(&self, detail: String) -> TranslateError {
        TranslateError::StackImbalance {
            func: self.func,
            offset: self.offset,
            detail,
        }
    }
}
