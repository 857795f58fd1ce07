//! Per-thread evaluation stack shared by the arguments, locals and
//! temporaries of every interpreted frame on the thread.
use crate::{
    config::InterpreterConfig,
    utils::SLOT_SIZE,
    value::{SlotValue, StackObject},
    vm::{
        error::{ExecutionError, MemoryError},
        frame::InterpFrame,
    },
};
use std::cell::RefCell;

/// Raw stack memory and cursors for one thread.
///
/// The stack is addressed in slots for frame bookkeeping and in bytes for
/// managed pointers. Storage grows on demand up to `max_slots`; offsets stay
/// valid across growth because nothing holds a raw pointer into it.
pub struct MachineState {
    stack: Vec<u8>,
    top: usize,
    max_slots: usize,
    local_pool: Vec<u8>,
    local_top: usize,
    pub(crate) frames: Vec<InterpFrame>,
}

thread_local! {
    static MACHINE: RefCell<Option<MachineState>> = const { RefCell::new(None) };
}

impl MachineState {
    pub fn new(initial_slots: usize, max_slots: usize) -> Self {
        let initial = initial_slots.min(max_slots);
        Self {
            stack: vec![0u8; initial * SLOT_SIZE],
            top: 0,
            max_slots,
            local_pool: vec![],
            local_top: 0,
            frames: vec![],
        }
    }

    /// Takes this thread's machine state, creating it on first use. A second
    /// interpreter alive on the same thread gets a private state.
    pub(crate) fn acquire(config: &InterpreterConfig) -> Self {
        MACHINE
            .with(|m| m.borrow_mut().take())
            .filter(|m| m.max_slots == config.stack_slots)
            .unwrap_or_else(|| Self::new(config.initial_stack_slots, config.stack_slots))
    }

    pub(crate) fn release(mut self) {
        self.frames.clear();
        self.top = 0;
        self.local_top = 0;
        MACHINE.with(|m| {
            let mut slot = m.borrow_mut();
            if slot.is_none() {
                *slot = Some(self);
            }
        });
    }

    pub fn top(&self) -> usize {
        self.top
    }

    pub fn capacity(&self) -> usize {
        self.max_slots
    }

    pub fn frames(&self) -> &[InterpFrame] {
        &self.frames
    }

    fn ensure_slots(&mut self, end: usize) -> Result<(), ExecutionError> {
        if end > self.max_slots {
            return Err(ExecutionError::StackOverflow {
                requested: end,
                capacity: self.max_slots,
            });
        }
        let have = self.stack.len() / SLOT_SIZE;
        if end > have {
            let grown = end.max(have * 2).min(self.max_slots);
            self.stack.resize(grown * SLOT_SIZE, 0);
        }
        Ok(())
    }

    /// Reserves `n` slots at the top and returns their first slot index.
    pub fn alloc_stack_slots(&mut self, n: usize) -> Result<usize, ExecutionError> {
        let base = self.top;
        self.reserve_to(base + n)?;
        Ok(base)
    }

    /// Raises the top to at least `end`.
    pub fn reserve_to(&mut self, end: usize) -> Result<(), ExecutionError> {
        if end > self.top {
            self.ensure_slots(end)?;
            self.top = end;
        }
        Ok(())
    }

    /// Rewinds the top. Everything above it becomes undefined.
    pub fn set_top(&mut self, top: usize) {
        self.top = top;
    }

    #[inline]
    pub fn read<T: SlotValue>(&self, byte_offset: usize) -> Result<T, MemoryError> {
        self.bytes(byte_offset, T::SIZE).map(T::read_from)
    }

    #[inline]
    pub fn write<T: SlotValue>(&mut self, byte_offset: usize, value: T) -> Result<(), MemoryError> {
        value.write_to(self.bytes_mut(byte_offset, T::SIZE)?);
        Ok(())
    }

    #[inline]
    pub fn slot(&self, index: usize) -> Result<StackObject, MemoryError> {
        self.read::<u64>(index * SLOT_SIZE).map(StackObject)
    }

    #[inline]
    pub fn set_slot(&mut self, index: usize, value: StackObject) -> Result<(), MemoryError> {
        self.write::<u64>(index * SLOT_SIZE, value.0)
    }

    pub fn slots(&self, base: usize, count: usize) -> Result<Vec<StackObject>, MemoryError> {
        (base..base + count).map(|i| self.slot(i)).collect()
    }

    pub fn write_slots(&mut self, base: usize, values: &[StackObject]) -> Result<(), MemoryError> {
        for (i, v) in values.iter().enumerate() {
            self.set_slot(base + i, *v)?;
        }
        Ok(())
    }

    /// Byte view of live stack memory, bounds-checked against the current top.
    pub fn bytes(&self, byte_offset: usize, len: usize) -> Result<&[u8], MemoryError> {
        let end = byte_offset.checked_add(len).filter(|&e| e <= self.top * SLOT_SIZE);
        end.map(|e| &self.stack[byte_offset..e])
            .ok_or(MemoryError::AccessViolation(byte_offset as u64))
    }

    pub fn bytes_mut(&mut self, byte_offset: usize, len: usize) -> Result<&mut [u8], MemoryError> {
        let end = byte_offset.checked_add(len).filter(|&e| e <= self.top * SLOT_SIZE);
        match end {
            Some(e) => Ok(&mut self.stack[byte_offset..e]),
            None => Err(MemoryError::AccessViolation(byte_offset as u64)),
        }
    }

    /// Carves `bytes` (8-byte aligned) out of the frame-scoped `localloc` pool.
    pub fn alloc_local(&mut self, bytes: usize) -> Result<usize, ExecutionError> {
        let start = crate::utils::align_up(self.local_top, SLOT_SIZE);
        let end = start + bytes;
        if end > self.max_slots * SLOT_SIZE {
            return Err(ExecutionError::StackOverflow {
                requested: crate::utils::slots_for_bytes(end),
                capacity: self.max_slots,
            });
        }
        if end > self.local_pool.len() {
            let grown = end.max(self.local_pool.len() * 2);
            self.local_pool.resize(grown, 0);
        }
        self.local_pool[start..end].fill(0);
        self.local_top = end;
        Ok(start)
    }

    pub fn local_top(&self) -> usize {
        self.local_top
    }

    pub fn set_local_top(&mut self, top: usize) {
        self.local_top = top;
    }

    pub fn local_bytes_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], MemoryError> {
        let end = offset.checked_add(len).filter(|&e| e <= self.local_top);
        match end {
            Some(e) => Ok(&mut self.local_pool[offset..e]),
            None => Err(MemoryError::AccessViolation(offset as u64)),
        }
    }

    /// Every live stack slot, for a collector scanning roots. Slots are
    /// untyped, so a precise collector must treat each as a potential reference.
    pub fn live_slots(&self) -> impl Iterator<Item = StackObject> + '_ {
        (0..self.top).filter_map(|i| self.slot(i).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_until_capacity() {
        let mut m = MachineState::new(4, 64);
        let base = m.alloc_stack_slots(10).unwrap();
        assert_eq!(base, 0);
        m.set_slot(9, StackObject(42)).unwrap();
        assert_eq!(m.slot(9).unwrap().0, 42);
        assert_eq!(m.slot(10), Err(MemoryError::AccessViolation(80)));
        assert_eq!(m.alloc_stack_slots(54).unwrap(), 10);
        assert_eq!(
            m.alloc_stack_slots(1),
            Err(ExecutionError::StackOverflow {
                requested: 65,
                capacity: 64
            })
        );
    }

    #[test]
    fn bytes_are_bounded_by_top() {
        let mut m = MachineState::new(8, 8);
        m.alloc_stack_slots(2).unwrap();
        assert!(m.bytes(8, 8).is_ok());
        assert!(m.bytes(12, 8).is_err());
        m.write::<i16>(3, -5).unwrap();
        assert_eq!(m.read::<i16>(3), Ok(-5));
        assert!(m.write::<u64>(12, 1).is_err());
    }

    #[test]
    fn localloc_is_rewound() {
        let mut m = MachineState::new(8, 64);
        let mark = m.local_top();
        let a = m.alloc_local(12).unwrap();
        let b = m.alloc_local(4).unwrap();
        assert_eq!((a, b), (0, 16));
        m.set_local_top(mark);
        assert_eq!(m.alloc_local(1).unwrap(), 0);
    }
}
