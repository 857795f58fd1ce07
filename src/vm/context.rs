use crate::{
    runtime::{exceptions::ExceptionKind, Runtime},
    utils::SLOT_SIZE,
    value::{Address, ObjectRef, SlotValue, StackObject},
    vm::{
        error::{ExecutionError, Fault, MemoryError},
        frame::{InterpFrame, InterpFrameGroup},
        memory::Memory,
        method_info::InterpMethodInfo,
        opcodes::Slot,
        stack::MachineState,
        tracer::Tracer,
        Interpreter,
    },
};
use parking_lot::MutexGuard;
use std::sync::Arc;

/// Register file of the innermost frame of one `execute` invocation.
///
/// Handlers see slots relative to the frame base; `base`, `method` and `ip`
/// are reloaded whenever the innermost frame changes.
pub struct ExecContext<'a> {
    pub(crate) interp: &'a mut Interpreter,
    pub(crate) group: InterpFrameGroup,
    host_ret: &'a mut [StackObject],
    pub(crate) method: Arc<InterpMethodInfo>,
    pub(crate) base: usize,
    pub(crate) ip: usize,
}

impl<'a> ExecContext<'a> {
    /// Binds to the innermost frame of `group`.
    pub(crate) fn new(
        interp: &'a mut Interpreter,
        group: InterpFrameGroup,
        host_ret: &'a mut [StackObject],
    ) -> Result<Self, ExecutionError> {
        let frame = interp
            .machine
            .frames
            .last()
            .ok_or_else(|| ExecutionError::CorruptFrame("no frame to execute".into()))?;
        let (method, base, ip) = (frame.method.clone(), frame.base, frame.ip);
        Ok(Self {
            interp,
            group,
            host_ret,
            method,
            base,
            ip,
        })
    }

    /// Re-binds to whatever frame is now innermost.
    pub(crate) fn reload(&mut self) -> Result<(), ExecutionError> {
        let frame = self.frame()?;
        let (method, base, ip) = (frame.method.clone(), frame.base, frame.ip);
        self.method = method;
        self.base = base;
        self.ip = ip;
        Ok(())
    }

    pub(crate) fn frame(&self) -> Result<&InterpFrame, ExecutionError> {
        self.interp
            .machine
            .frames
            .last()
            .ok_or_else(|| ExecutionError::CorruptFrame("frame stack empty".into()))
    }

    pub(crate) fn frame_mut(&mut self) -> Result<&mut InterpFrame, ExecutionError> {
        self.interp
            .machine
            .frames
            .last_mut()
            .ok_or_else(|| ExecutionError::CorruptFrame("frame stack empty".into()))
    }

    pub fn runtime(&self) -> &Runtime {
        &self.interp.runtime
    }

    pub(crate) fn runtime_arc(&self) -> Arc<Runtime> {
        self.interp.runtime.clone()
    }

    pub fn machine(&mut self) -> &mut MachineState {
        &mut self.interp.machine
    }

    pub fn memory(&mut self) -> Memory<'_> {
        Memory::new(&self.interp.runtime, &mut self.interp.machine)
    }

    pub(crate) fn host_ret(&mut self) -> &mut [StackObject] {
        &mut *self.host_ret
    }

    pub fn tracer_enabled(&self) -> bool {
        self.interp.runtime.tracer_enabled()
    }

    pub fn tracer(&self) -> MutexGuard<'_, Tracer> {
        self.interp.runtime.tracer()
    }

    pub fn indent(&self) -> usize {
        self.interp.machine.frames.len().saturating_sub(1)
    }

    // ---- slots ------------------------------------------------------------

    /// Absolute slot index of `s`, which must lie inside the current frame.
    #[inline]
    pub fn abs(&self, s: Slot) -> Result<usize, MemoryError> {
        let frame_slots = self.method.max_stack_size as usize;
        if s.index() < frame_slots {
            Ok(self.base + s.index())
        } else {
            Err(MemoryError::SlotOutOfFrame {
                slot: s.index(),
                frame_slots,
            })
        }
    }

    /// Byte offset of a frame slot on the evaluation stack.
    #[inline]
    pub fn byte_offset(&self, s: Slot) -> Result<usize, MemoryError> {
        Ok(self.abs(s)? * SLOT_SIZE)
    }

    #[inline]
    pub fn get(&self, s: Slot) -> Result<StackObject, MemoryError> {
        self.interp.machine.slot(self.abs(s)?)
    }

    #[inline]
    pub fn set(&mut self, s: Slot, v: StackObject) -> Result<(), MemoryError> {
        let i = self.abs(s)?;
        self.interp.machine.set_slot(i, v)
    }

    #[inline]
    pub fn slot<T: SlotValue>(&self, s: Slot) -> Result<T, MemoryError> {
        self.interp.machine.read(self.byte_offset(s)?)
    }

    /// Writes `v` to the low bytes of the slot and clears the rest.
    #[inline]
    pub fn set_slot<T: SlotValue>(&mut self, s: Slot, v: T) -> Result<(), MemoryError> {
        let at = self.byte_offset(s)?;
        self.interp.machine.write::<u64>(at, 0)?;
        self.interp.machine.write(at, v)
    }

    pub fn slot_bytes(&self, s: Slot, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.interp
            .machine
            .bytes(self.byte_offset(s)?, len)
            .map(<[u8]>::to_vec)
    }

    /// Copies `bytes` into consecutive slots starting at `s`, zero-padding the
    /// last slot.
    pub fn set_slot_bytes(&mut self, s: Slot, bytes: &[u8]) -> Result<(), MemoryError> {
        let at = self.byte_offset(s)?;
        let padded = crate::utils::slots_for_bytes(bytes.len()) * SLOT_SIZE;
        let dst = self.interp.machine.bytes_mut(at, padded)?;
        dst[..bytes.len()].copy_from_slice(bytes);
        dst[bytes.len()..].fill(0);
        Ok(())
    }

    /// Address of a frame slot, as produced by `ldloca`.
    pub fn slot_address(&self, s: Slot) -> Result<Address, MemoryError> {
        Ok(Address::Stack(self.byte_offset(s)?))
    }

    // ---- values -----------------------------------------------------------

    /// Non-null object in slot `s`.
    pub fn object(&mut self, s: Slot) -> Result<ObjectRef, Fault> {
        match self.get(s)?.as_ref() {
            Some(o) => Ok(o),
            None => Err(self.exception(ExceptionKind::NullReference)),
        }
    }

    /// Non-null managed address in slot `s`.
    pub fn address(&mut self, s: Slot) -> Result<Address, Fault> {
        match self.get(s)?.as_address()? {
            Some(a) => Ok(a),
            None => Err(self.exception(ExceptionKind::NullReference)),
        }
    }

    /// Location of a field given the slot holding either an object reference
    /// or a managed pointer to a value type.
    pub fn field_address(&mut self, s: Slot, offset: u32) -> Result<Address, Fault> {
        let word = self.get(s)?;
        if word.0 == 0 {
            return Err(self.exception(ExceptionKind::NullReference));
        }
        if let Some(object) = ObjectRef::from_word(word.0) {
            return Ok(Address::Heap { object, offset });
        }
        match word.as_address()? {
            Some(a) => Ok(a.offset_by(offset as isize)),
            None => Err(self.exception(ExceptionKind::NullReference)),
        }
    }

    /// Builds a managed exception of a well-known kind.
    pub fn exception(&self, kind: ExceptionKind) -> Fault {
        Fault::Managed(self.interp.runtime.new_exception(kind, None))
    }

    pub fn exception_with(&self, kind: ExceptionKind, message: String) -> Fault {
        Fault::Managed(self.interp.runtime.new_exception(kind, Some(message)))
    }
}
