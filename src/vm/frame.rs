//! Interpreted activation records and the group of frames belonging to one
//! `execute` call.
use crate::{
    value::StackObject,
    vm::{
        error::VmError, exceptions::ExceptionFlowStack, method_info::InterpMethodInfo,
        stack::MachineState,
    },
};
use std::sync::Arc;

/// Where a returning frame writes its result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetTarget {
    Discard,
    /// Absolute slot index in the caller's frame.
    Slot(usize),
    /// The host-supplied return buffer of the group's outermost frame.
    Host,
}

pub struct InterpFrame {
    pub method: Arc<InterpMethodInfo>,
    /// Absolute slot index of argument 0.
    pub base: usize,
    pub old_stack_top: usize,
    pub old_local_top: usize,
    pub ret: RetTarget,
    /// Resume offset once a callee returns.
    pub ip: usize,
    /// Offset of the call instruction currently in flight.
    pub call_ip: usize,
    pub flow: ExceptionFlowStack,
}

/// How a new frame's arguments get there.
pub enum ArgSource<'a> {
    /// The caller already laid arguments out at this absolute slot.
    InPlace(usize),
    /// Block copy of frame-layout slots.
    Slots(&'a [StackObject]),
    /// The caller fills the argument region after entry.
    Deferred,
}

/// Frames pushed by one `execute` invocation, on top of whatever the thread
/// was already running.
#[derive(Clone, Copy, Debug)]
pub struct InterpFrameGroup {
    base_depth: usize,
}

impl InterpFrameGroup {
    pub fn new(machine: &MachineState) -> Self {
        Self {
            base_depth: machine.frames.len(),
        }
    }

    pub fn base_depth(&self) -> usize {
        self.base_depth
    }

    pub fn depth(&self, machine: &MachineState) -> usize {
        machine.frames.len() - self.base_depth
    }

    pub fn is_exhausted(&self, machine: &MachineState) -> bool {
        machine.frames.len() <= self.base_depth
    }

    /// Pushes a frame for `method` and returns its base slot.
    pub fn enter_frame(
        &self,
        machine: &mut MachineState,
        method: Arc<InterpMethodInfo>,
        args: ArgSource<'_>,
        ret: RetTarget,
    ) -> Result<usize, VmError> {
        let old_stack_top = machine.top();
        let footprint = method.max_stack_size as usize;
        let base = match args {
            ArgSource::InPlace(base) => {
                machine.reserve_to(base + footprint)?;
                base
            }
            ArgSource::Slots(values) => {
                let base = machine.alloc_stack_slots(footprint)?;
                let n = values.len().min(method.arg_stack_size as usize);
                machine.write_slots(base, &values[..n])?;
                base
            }
            ArgSource::Deferred => machine.alloc_stack_slots(footprint)?,
        };
        machine.frames.push(InterpFrame {
            method,
            base,
            old_stack_top,
            old_local_top: machine.local_top(),
            ret,
            ip: 0,
            call_ip: 0,
            flow: ExceptionFlowStack::default(),
        });
        Ok(base)
    }

    /// Pops the innermost frame and restores the stack it found. Returns the
    /// popped frame, or `None` if the group has no frames left.
    pub fn leave_frame(&self, machine: &mut MachineState) -> Option<InterpFrame> {
        if self.is_exhausted(machine) {
            return None;
        }
        let frame = machine.frames.pop()?;
        machine.set_top(frame.old_stack_top);
        machine.set_local_top(frame.old_local_top);
        Some(frame)
    }

    /// Drops every frame of the group, as after a fatal error.
    pub fn unwind_all(&self, machine: &mut MachineState) {
        while self.leave_frame(machine).is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{types::{MethodHandle, TypeDesc}, vm::method_info::InterpMethodInfo};

    fn info(args: u16, max: u16) -> Arc<InterpMethodInfo> {
        Arc::new(InterpMethodInfo {
            method: MethodHandle(0),
            name: "T::m".into(),
            codes: Box::new([]),
            args: Box::new([]),
            arg_stack_size: args,
            local_var_base_offset: args,
            local_stack_size: 0,
            eval_stack_base_offset: args,
            max_stack_size: max,
            ret: TypeDesc::Void,
            ret_slots: 0,
            ex_clauses: Box::new([]),
            resolve_datas: Box::new([]),
            is_trivial_copy_args: true,
        })
    }

    #[test]
    fn in_place_frames_overlap_caller_arguments() {
        let mut m = MachineState::new(16, 1024);
        let group = InterpFrameGroup::new(&m);
        let outer = group
            .enter_frame(&mut m, info(0, 8), ArgSource::Deferred, RetTarget::Host)
            .unwrap();
        assert_eq!(m.top(), 8);
        let inner = group
            .enter_frame(&mut m, info(2, 10), ArgSource::InPlace(outer + 6), RetTarget::Slot(outer + 6))
            .unwrap();
        assert_eq!(inner, 6);
        assert_eq!(m.top(), 16);
        group.leave_frame(&mut m).unwrap();
        assert_eq!(m.top(), 8);
    }

    #[test]
    fn copied_arguments_land_at_frame_base() {
        let mut m = MachineState::new(16, 1024);
        let group = InterpFrameGroup::new(&m);
        let base = group
            .enter_frame(
                &mut m,
                info(2, 4),
                ArgSource::Slots(&[StackObject(7), StackObject(9)]),
                RetTarget::Host,
            )
            .unwrap();
        assert_eq!(m.slot(base).unwrap().0, 7);
        assert_eq!(m.slot(base + 1).unwrap().0, 9);
    }

    #[test]
    fn leaving_an_exhausted_group_is_none() {
        let mut m = MachineState::new(16, 1024);
        let outer = InterpFrameGroup::new(&m);
        outer
            .enter_frame(&mut m, info(0, 2), ArgSource::Deferred, RetTarget::Host)
            .unwrap();
        let nested = InterpFrameGroup::new(&m);
        assert!(nested.leave_frame(&mut m).is_none());
        assert_eq!(nested.depth(&m), 0);
        assert!(outer.leave_frame(&mut m).is_some());
    }
}
