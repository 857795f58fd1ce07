//! Assembles interpreted method bodies.
//!
//! The builder owns the frame layout (arguments, then locals, then the
//! evaluation area whose first slot is reserved for the in-flight exception),
//! patches forward branches once labels are placed and validates the finished
//! code stream.
use crate::{
    runtime::Runtime,
    types::{ClassHandle, MethodHandle, TypeDesc},
    vm::{
        abi::{self, TargetAbi},
        error::{BuildError, DecodeError, VmError},
        method_info::{ArgDesc, ClauseKind, InterpExceptionClause, InterpMethodInfo, ResolveData},
        opcodes::{self, Instruction, Slot, Target},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Handler kind of a protected region, with filter entry given as a label.
#[derive(Clone, Copy, Debug)]
pub enum Handler {
    Catch(ClassHandle),
    Filter(Label),
    Finally,
    Fault,
}

struct PendingClause {
    handler: Handler,
    try_range: (Label, Label),
    handler_range: (Label, Label),
}

pub struct InterpMethodBuilder {
    method: MethodHandle,
    name: String,
    args: Vec<ArgDesc>,
    arg_offsets: Vec<usize>,
    arg_stack_size: usize,
    local_offsets: Vec<usize>,
    local_stack_size: usize,
    eval_used: usize,
    ret: TypeDesc,
    ret_slots: usize,
    codes: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
    tables: Vec<(u32, Vec<Label>)>,
    /// Offset and table index of every `switch`.
    switches: Vec<(usize, u32)>,
    clauses: Vec<PendingClause>,
    resolve: Vec<ResolveData>,
}

impl InterpMethodBuilder {
    pub fn new(rt: &Runtime, method: MethodHandle, locals: &[TypeDesc]) -> Result<Self, VmError> {
        let desc = rt.method(method)?;
        let args = abi::describe_args(rt, TargetAbi::host(), desc)?;
        let mut arg_offsets = Vec::with_capacity(args.len());
        let mut cursor = 0;
        for a in &args {
            arg_offsets.push(cursor);
            cursor += a.slots as usize;
        }
        let arg_stack_size = cursor;
        let mut local_offsets = Vec::with_capacity(locals.len());
        for &ty in locals {
            local_offsets.push(cursor);
            cursor += rt.type_slots(ty)?.max(1);
        }
        let ret_slots = match desc.ret {
            TypeDesc::Void => 0,
            ty => rt.type_slots(ty)?.max(1),
        };

        let mut builder = Self {
            method,
            name: rt.method_name(method),
            args,
            arg_offsets,
            arg_stack_size,
            local_offsets,
            local_stack_size: cursor - arg_stack_size,
            eval_used: 0,
            ret: desc.ret,
            ret_slots,
            codes: vec![],
            labels: vec![],
            fixups: vec![],
            tables: vec![],
            switches: vec![],
            clauses: vec![],
            resolve: vec![],
        };
        if builder.local_stack_size > 0 {
            let count = slot_u16(builder.local_stack_size)?;
            builder.emit(Instruction::InitLocals {
                base: Slot(slot_u16(arg_stack_size)?),
                count,
            });
        }
        Ok(builder)
    }

    pub fn arg(&self, i: usize) -> Result<Slot, BuildError> {
        let at = *self.arg_offsets.get(i).ok_or(BuildError::NoSuchArgument(i))?;
        slot_u16(at).map(Slot)
    }

    pub fn local(&self, i: usize) -> Result<Slot, BuildError> {
        let at = *self.local_offsets.get(i).ok_or(BuildError::NoSuchLocal(i))?;
        slot_u16(at).map(Slot)
    }

    fn eval_base(&self) -> usize {
        self.arg_stack_size + self.local_stack_size
    }

    /// Slot where handlers find the exception being handled.
    pub fn exception_slot(&self) -> Slot {
        Slot(self.eval_base() as u16)
    }

    /// Evaluation temporary `i`. Call arguments for callees are laid out in
    /// consecutive temporaries, so `eval(i)` doubles as an argument base.
    pub fn eval(&mut self, i: u16) -> Slot {
        self.eval_used = self.eval_used.max(i as usize + 1);
        Slot((self.eval_base() + 1 + i as usize) as u16)
    }

    /// Reserves `n` temporaries starting at `i` without naming them.
    pub fn reserve_eval(&mut self, i: u16, n: u16) {
        self.eval_used = self.eval_used.max(i as usize + n as usize);
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn place(&mut self, label: Label) {
        self.labels[label.0] = Some(self.codes.len() as u32);
    }

    pub fn here(&mut self) -> Label {
        let l = self.new_label();
        self.place(l);
        l
    }

    pub fn offset(&self) -> usize {
        self.codes.len()
    }

    /// Appends one instruction and returns its offset.
    pub fn emit(&mut self, instr: Instruction) -> usize {
        let at = self.codes.len();
        instr.encode(&mut self.codes);
        at
    }

    /// Emits a branching instruction whose target is patched once `label` is
    /// placed. The target is always the last operand.
    pub fn emit_branch(&mut self, make: impl FnOnce(Target) -> Instruction, label: Label) -> usize {
        let at = self.emit(make(Target(0)));
        self.fixups.push((self.codes.len() - 4, label));
        at
    }

    pub fn switch(&mut self, value: Slot, targets: &[Label]) -> usize {
        let table = self.add_resolve(ResolveData::BranchTable(vec![]));
        self.tables.push((table, targets.to_vec()));
        let at = self.emit(Instruction::Switch { value, table });
        self.switches.push((at, table));
        at
    }

    pub fn add_resolve(&mut self, data: ResolveData) -> u32 {
        self.resolve.push(data);
        (self.resolve.len() - 1) as u32
    }

    pub fn add_string(&mut self, s: impl Into<String>) -> u32 {
        self.add_resolve(ResolveData::Str(s.into()))
    }

    pub fn add_slot_list(&mut self, slots: Vec<Slot>) -> u32 {
        self.add_resolve(ResolveData::SlotList(slots))
    }

    /// Registers a protected region. Nested regions must be added innermost
    /// first.
    pub fn add_clause(&mut self, handler: Handler, try_range: (Label, Label), handler_range: (Label, Label)) {
        self.clauses.push(PendingClause {
            handler,
            try_range,
            handler_range,
        });
    }

    fn resolve_label(&self, label: Label) -> Result<u32, BuildError> {
        self.labels
            .get(label.0)
            .copied()
            .flatten()
            .ok_or(BuildError::UnboundLabel(label.0))
    }

    pub fn finish(mut self) -> Result<InterpMethodInfo, VmError> {
        for (at, label) in std::mem::take(&mut self.fixups) {
            let target = self.resolve_label(label)?;
            self.codes[at..at + 4].copy_from_slice(&target.to_le_bytes());
        }
        for (index, labels) in std::mem::take(&mut self.tables) {
            let targets = labels
                .into_iter()
                .map(|l| self.resolve_label(l))
                .collect::<Result<Vec<_>, _>>()?;
            self.resolve[index as usize] = ResolveData::BranchTable(targets);
        }
        let ex_clauses = self
            .clauses
            .iter()
            .map(|c| {
                let kind = match c.handler {
                    Handler::Catch(class) => ClauseKind::Catch(class),
                    Handler::Filter(l) => ClauseKind::Filter {
                        filter_begin: self.resolve_label(l)?,
                    },
                    Handler::Finally => ClauseKind::Finally,
                    Handler::Fault => ClauseKind::Fault,
                };
                Ok(InterpExceptionClause {
                    kind,
                    try_begin: self.resolve_label(c.try_range.0)?,
                    try_end: self.resolve_label(c.try_range.1)?,
                    handler_begin: self.resolve_label(c.handler_range.0)?,
                    handler_end: self.resolve_label(c.handler_range.1)?,
                })
            })
            .collect::<Result<Vec<_>, BuildError>>()?;

        let starts = opcodes::validate(&self.codes)?;
        for &(at, index) in &self.switches {
            if let ResolveData::BranchTable(targets) = &self.resolve[index as usize] {
                for &target in targets {
                    if starts.binary_search(&(target as usize)).is_err() {
                        return Err(DecodeError::BadBranchTarget {
                            offset: at,
                            target: target as usize,
                        }
                        .into());
                    }
                }
            }
        }

        let max_stack_size = slot_u16(self.eval_base() + 1 + self.eval_used)?;
        let is_trivial_copy_args = abi::is_trivial_copy(&self.args);
        tracing::trace!(method = %self.name, bytes = self.codes.len(), slots = max_stack_size, "body assembled");
        let info = InterpMethodInfo {
            method: self.method,
            name: self.name,
            codes: self.codes.into_boxed_slice(),
            args: self.args.into_boxed_slice(),
            arg_stack_size: slot_u16(self.arg_stack_size)?,
            local_var_base_offset: slot_u16(self.arg_stack_size)?,
            local_stack_size: slot_u16(self.local_stack_size)?,
            eval_stack_base_offset: slot_u16(self.arg_stack_size + self.local_stack_size)?,
            max_stack_size,
            ret: self.ret,
            ret_slots: slot_u16(self.ret_slots)?,
            ex_clauses: ex_clauses.into_boxed_slice(),
            resolve_datas: self.resolve.into_boxed_slice(),
            is_trivial_copy_args,
        };
        info.check_slots()?;
        Ok(info)
    }
}

fn slot_u16(n: usize) -> Result<u16, BuildError> {
    u16::try_from(n).map_err(|_| BuildError::TooManySlots(n))
}
