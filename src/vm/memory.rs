//! Loads and stores through managed addresses.
use crate::{
    runtime::Runtime,
    value::{
        storage::{with_thread_statics, BarrierTarget},
        Address, ObjectRef, SlotValue,
    },
    vm::{error::MemoryError, stack::MachineState},
};

/// Resolves [`Address`]es against the thread's stack and the runtime's heap
/// and static storage.
pub struct Memory<'a> {
    rt: &'a Runtime,
    machine: &'a mut MachineState,
}

impl<'a> Memory<'a> {
    pub fn new(rt: &'a Runtime, machine: &'a mut MachineState) -> Self {
        Self { rt, machine }
    }

    fn with_bytes<R>(
        &mut self,
        addr: Address,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MemoryError> {
        let violation = || MemoryError::AccessViolation(addr.to_word());
        match addr {
            Address::Stack(offset) => self.machine.bytes_mut(offset, len).map(f),
            Address::LocalAlloc(offset) => self.machine.local_bytes_mut(offset, len).map(f),
            Address::Heap { object, offset } => {
                let mut heap = self.rt.heap();
                let data = &mut heap.get_mut(object)?.data;
                let start = offset as usize;
                data.get_mut(start..start + len).map(f).ok_or_else(violation)
            }
            Address::Static { class, offset } => {
                let mut heap = self.rt.heap();
                let block = heap.statics_mut(class)?;
                let start = offset as usize;
                block.get_mut(start..start + len).map(f).ok_or_else(violation)
            }
            Address::ThreadStatic { class, offset } => {
                let size = self
                    .rt
                    .class(class)
                    .map_err(|_| violation())?
                    .thread_static_size;
                let start = offset as usize;
                with_thread_statics(self.rt.id(), class, size, |block| {
                    block.get_mut(start..start + len).map(f)
                })
                .ok_or_else(violation)
            }
        }
    }

    fn barrier(&self, addr: Address, value: Option<ObjectRef>) {
        let target = match addr {
            Address::Heap { object, .. } => BarrierTarget::Object(object),
            Address::Static { class, .. } => BarrierTarget::Static(class),
            Address::ThreadStatic { class, .. } => BarrierTarget::ThreadStatic(class),
            Address::Stack(_) | Address::LocalAlloc(_) => return,
        };
        self.rt.write_barrier().reference_stored(target, value);
    }

    pub fn read<T: SlotValue>(&mut self, addr: Address) -> Result<T, MemoryError> {
        self.with_bytes(addr, T::SIZE, |b| T::read_from(b))
    }

    /// Stores a non-reference value.
    pub fn write<T: SlotValue>(&mut self, addr: Address, value: T) -> Result<(), MemoryError> {
        self.with_bytes(addr, T::SIZE, |b| value.write_to(b))
    }

    /// Stores an object reference and reports it to the write barrier.
    pub fn write_ref(&mut self, addr: Address, value: Option<ObjectRef>) -> Result<(), MemoryError> {
        self.with_bytes(addr, 8, |b| value.write_to(b))?;
        self.barrier(addr, value);
        Ok(())
    }

    pub fn read_bytes(&mut self, addr: Address, out: &mut [u8]) -> Result<(), MemoryError> {
        self.with_bytes(addr, out.len(), |b| out.copy_from_slice(b))
    }

    /// Stores raw bytes. A block that may hold references is reported to the
    /// barrier without a specific value.
    pub fn write_bytes(&mut self, addr: Address, bytes: &[u8], may_hold_refs: bool) -> Result<(), MemoryError> {
        self.with_bytes(addr, bytes.len(), |b| b.copy_from_slice(bytes))?;
        if may_hold_refs {
            self.barrier(addr, None);
        }
        Ok(())
    }

    pub fn fill(&mut self, addr: Address, value: u8, len: usize) -> Result<(), MemoryError> {
        self.with_bytes(addr, len, |b| b.fill(value))
    }

    pub fn copy(&mut self, dst: Address, src: Address, len: usize, may_hold_refs: bool) -> Result<(), MemoryError> {
        let mut tmp = vec![0u8; len];
        self.read_bytes(src, &mut tmp)?;
        self.write_bytes(dst, &tmp, may_hold_refs)
    }
}
