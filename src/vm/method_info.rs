use crate::{
    types::{ClassHandle, MethodHandle, TypeDesc},
    utils::DebugStr,
    vm::{
        abi::LocationKind,
        error::{BuildError, ExecutionError, VmError},
        opcodes::{self, Instruction, Slot},
    },
};
use std::fmt::{Debug, Formatter};

/// How one argument is laid out, both in the frame and in host argument arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArgDesc {
    pub kind: LocationKind,
    pub ty: TypeDesc,
    /// Slots the argument occupies inside the frame.
    pub slots: u16,
}

impl ArgDesc {
    /// Slots the argument occupies in a host argument array.
    pub fn host_slots(&self) -> usize {
        match self.kind {
            LocationKind::Indirect(_) => 1,
            _ => self.slots as usize,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClauseKind {
    /// Catches exceptions assignable to the class.
    Catch(ClassHandle),
    /// Filter code runs from `filter_begin` up to the handler start.
    Filter { filter_begin: u32 },
    Finally,
    Fault,
}

/// One protected region. Within a method, clauses are ordered innermost first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterpExceptionClause {
    pub kind: ClauseKind,
    pub try_begin: u32,
    pub try_end: u32,
    pub handler_begin: u32,
    pub handler_end: u32,
}

impl InterpExceptionClause {
    pub fn try_contains(&self, offset: u32) -> bool {
        self.try_begin <= offset && offset < self.try_end
    }

    pub fn handler_contains(&self, offset: u32) -> bool {
        self.handler_begin <= offset && offset < self.handler_end
    }

    /// Start of the code that runs first when this clause is selected.
    pub fn entry(&self) -> u32 {
        match self.kind {
            ClauseKind::Filter { filter_begin } => filter_begin,
            _ => self.handler_begin,
        }
    }
}

/// Side-table entry referenced from instructions by index.
#[derive(Clone, Debug, PartialEq)]
pub enum ResolveData {
    /// Frame slots, e.g. array dimensions or indices.
    SlotList(Vec<Slot>),
    /// Integer list, e.g. array lower bounds known at emit time.
    Ints(Vec<i32>),
    /// `switch` targets, absolute code offsets.
    BranchTable(Vec<u32>),
    Str(String),
    Method(MethodHandle),
    Class(ClassHandle),
}

/// Immutable interpreted body, shared by every thread running the method.
pub struct InterpMethodInfo {
    pub method: MethodHandle,
    pub name: String,
    pub codes: Box<[u8]>,
    pub args: Box<[ArgDesc]>,
    /// Slots taken by arguments, `this` included.
    pub arg_stack_size: u16,
    pub local_var_base_offset: u16,
    pub local_stack_size: u16,
    /// First evaluation slot; holds the in-flight exception inside handlers.
    pub eval_stack_base_offset: u16,
    /// Total frame footprint in slots.
    pub max_stack_size: u16,
    pub ret: TypeDesc,
    pub ret_slots: u16,
    pub ex_clauses: Box<[InterpExceptionClause]>,
    pub resolve_datas: Box<[ResolveData]>,
    /// Host arguments can be block-copied into the frame.
    pub is_trivial_copy_args: bool,
}

impl Debug for InterpMethodInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let code = match opcodes::disassemble(&self.codes) {
            Ok(listing) => format!("{} instructions, {} bytes", listing.len(), self.codes.len()),
            Err(e) => format!("undecodable: {e}"),
        };
        f.debug_struct("InterpMethodInfo")
            .field("name", &DebugStr(self.name.clone()))
            .field("codes", &DebugStr(code))
            .field("args", &self.arg_stack_size)
            .field("locals", &self.local_stack_size)
            .field("max_stack", &self.max_stack_size)
            .field("ret", &self.ret)
            .field("ex_clauses", &self.ex_clauses)
            .field("resolve_datas", &self.resolve_datas.len())
            .finish()
    }
}

impl InterpMethodInfo {
    /// Checks that every slot operand, direct or through a slot list, lies
    /// inside the frame.
    pub fn check_slots(&self) -> Result<(), VmError> {
        let frame_slots = self.max_stack_size as usize;
        for (offset, instr) in opcodes::disassemble(&self.codes)? {
            let lists = match instr {
                Instruction::NewMdArr { lengths, .. } => [Some(lengths), None],
                Instruction::NewMdArrBounded { lengths, bounds, .. } => [Some(lengths), Some(bounds)],
                Instruction::GetMdElem { indices, .. }
                | Instruction::SetMdElem { indices, .. }
                | Instruction::GetMdElemAddr { indices, .. } => [Some(indices), None],
                _ => [None, None],
            };
            let listed = lists
                .into_iter()
                .flatten()
                .filter_map(|i| match self.resolve_datas.get(i as usize) {
                    Some(ResolveData::SlotList(list)) => list.iter().map(|s| s.index()).max(),
                    _ => None,
                })
                .max();
            let direct = instr.max_slot().map(Slot::index);
            if let Some(slot) = direct.max(listed).filter(|&s| s >= frame_slots) {
                return Err(BuildError::SlotOutOfFrame {
                    offset,
                    slot,
                    frame_slots,
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn resolve(&self, index: u32) -> Result<&ResolveData, VmError> {
        self.resolve_datas
            .get(index as usize)
            .ok_or_else(|| ExecutionError::InvalidResolveData { index }.into())
    }

    pub fn slot_list(&self, index: u32) -> Result<&[Slot], VmError> {
        match self.resolve(index)? {
            ResolveData::SlotList(s) => Ok(s),
            _ => Err(ExecutionError::InvalidResolveData { index }.into()),
        }
    }

    pub fn ints(&self, index: u32) -> Result<&[i32], VmError> {
        match self.resolve(index)? {
            ResolveData::Ints(v) => Ok(v),
            _ => Err(ExecutionError::InvalidResolveData { index }.into()),
        }
    }

    pub fn branch_table(&self, index: u32) -> Result<&[u32], VmError> {
        match self.resolve(index)? {
            ResolveData::BranchTable(t) => Ok(t),
            _ => Err(ExecutionError::InvalidResolveData { index }.into()),
        }
    }

    pub fn string(&self, index: u32) -> Result<&str, VmError> {
        match self.resolve(index)? {
            ResolveData::Str(s) => Ok(s),
            _ => Err(ExecutionError::InvalidResolveData { index }.into()),
        }
    }

    pub fn host_arg_slots(&self) -> usize {
        self.args.iter().map(ArgDesc::host_slots).sum()
    }
}
