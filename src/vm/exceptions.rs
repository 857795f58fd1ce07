//! Structured exception flow.
//!
//! Each frame carries a small stack of [`ExceptionFlowInfo`]s. A flow is either
//! a propagating exception or a `leave` on its way to a target; it records
//! where unwinding started and how far through the clause table the search
//! has progressed. A flow is suspended while one of its handlers runs and
//! resumes at `endfinally` or a failing `endfilter`.
use crate::{
    runtime::exceptions::ExceptionKind,
    value::{object::StackTraceEntry, ObjectRef, StackObject},
    vm::{
        context::ExecContext,
        error::{ExecuteError, ExecutionError, Fault, MemoryError, VmError},
        method_info::ClauseKind,
        StepResult,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowKind {
    Exception(ObjectRef),
    Leave { target: u32 },
}

/// The handler or filter a flow is currently running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveClause {
    pub clause: usize,
    pub begin: u32,
    pub end: u32,
    pub in_filter: bool,
}

impl ActiveClause {
    pub fn contains(&self, offset: u32) -> bool {
        self.begin <= offset && offset < self.end
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionFlowInfo {
    pub kind: FlowKind,
    /// Where unwinding started: the throwing or leaving instruction.
    pub throw_offset: u32,
    /// First clause not yet examined.
    pub next_clause: usize,
    pub active: Option<ActiveClause>,
}

impl ExceptionFlowInfo {
    pub fn new(kind: FlowKind, throw_offset: u32) -> Self {
        Self {
            kind,
            throw_offset,
            next_clause: 0,
            active: None,
        }
    }

    fn covers(&self, offset: u32) -> bool {
        self.active.is_some_and(|a| a.contains(offset))
    }
}

/// Per-frame flow stack: the active flow and one interrupted flow inline,
/// anything deeper in a lazily allocated vector.
#[derive(Clone, Debug, Default)]
pub struct ExceptionFlowStack {
    cur: Option<ExceptionFlowInfo>,
    prev: Option<ExceptionFlowInfo>,
    spill: Option<Vec<ExceptionFlowInfo>>,
}

impl ExceptionFlowStack {
    pub fn push(&mut self, info: ExceptionFlowInfo) {
        if let Some(prev) = self.prev.take() {
            self.spill.get_or_insert_with(Vec::new).push(prev);
        }
        self.prev = self.cur.take();
        self.cur = Some(info);
    }

    pub fn pop(&mut self) -> Option<ExceptionFlowInfo> {
        let top = self.cur.take();
        self.cur = self.prev.take();
        self.prev = self.spill.as_mut().and_then(Vec::pop);
        top
    }

    pub fn current(&self) -> Option<&ExceptionFlowInfo> {
        self.cur.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut ExceptionFlowInfo> {
        self.cur.as_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.cur.is_none()
    }

    pub fn depth(&self) -> usize {
        self.cur.is_some() as usize
            + self.prev.is_some() as usize
            + self.spill.as_ref().map_or(0, Vec::len)
    }

    pub fn has_spilled(&self) -> bool {
        self.spill.is_some()
    }

    /// Drops flows whose running handler does not contain `offset`.
    pub fn discard_outside(&mut self, offset: u32) {
        while self.cur.is_some_and(|f| !f.covers(offset)) {
            self.pop();
        }
    }

    /// Keeps the top flow but drops interrupted flows it has escaped from.
    fn discard_escaped(&mut self, offset: u32) {
        if let Some(top) = self.pop() {
            self.discard_outside(offset);
            self.push(top);
        }
    }
}

fn no_flow(ctx: &ExecContext) -> Fault {
    ExecutionError::NoActiveExceptionFlow { offset: ctx.ip }.into()
}

/// Raises `ex` at `offset` in the innermost frame. Counting and the stack
/// trace happen here, once per raise; the search itself is [`throw`].
pub(crate) fn raise(ctx: &mut ExecContext, ex: ObjectRef, offset: usize) -> Result<StepResult, Fault> {
    let rt = ctx.runtime_arc();
    rt.metrics().record_exception();
    rt.record_stack_trace(ex, || {
        let frames = ctx.interp.machine.frames();
        frames
            .iter()
            .enumerate()
            .rev()
            .map(|(i, f)| StackTraceEntry {
                method: f.method.name.clone(),
                offset: if i + 1 == frames.len() { offset } else { f.call_ip } as u32,
            })
            .collect()
    });
    vm_trace_exception!(ctx, rt.describe_exception(ex), &ctx.method.name, offset);
    throw(ctx, ex, offset)
}

/// Starts propagating `ex` from `offset` in the innermost frame.
fn throw(ctx: &mut ExecContext, ex: ObjectRef, offset: usize) -> Result<StepResult, Fault> {
    let frame = ctx.frame_mut()?;
    frame.flow.discard_outside(offset as u32);
    frame
        .flow
        .push(ExceptionFlowInfo::new(FlowKind::Exception(ex), offset as u32));
    continue_search(ctx)
}

/// Resumes the innermost flow from its next unexamined clause.
pub(crate) fn continue_search(ctx: &mut ExecContext) -> Result<StepResult, Fault> {
    let rt = ctx.runtime_arc();
    let info = ctx.method.clone();
    let flow = *ctx.frame()?.flow.current().ok_or_else(|| no_flow(ctx))?;

    let mut found = None;
    for (k, c) in info.ex_clauses.iter().enumerate().skip(flow.next_clause) {
        let hit = match flow.kind {
            FlowKind::Exception(ex) => {
                if !c.try_contains(flow.throw_offset) {
                    continue;
                }
                match c.kind {
                    ClauseKind::Catch(class) => {
                        let actual = rt.object_class(ex)?;
                        rt.is_assignable(actual, class)
                            .then_some((c.handler_begin, c.handler_end, false))
                    }
                    ClauseKind::Filter { filter_begin } => {
                        Some((filter_begin, c.handler_begin, true))
                    }
                    ClauseKind::Finally | ClauseKind::Fault => {
                        Some((c.handler_begin, c.handler_end, false))
                    }
                }
            }
            FlowKind::Leave { target } => (c.kind == ClauseKind::Finally
                && c.try_contains(flow.throw_offset)
                && !c.try_contains(target))
            .then_some((c.handler_begin, c.handler_end, false)),
        };
        if let Some((begin, end, in_filter)) = hit {
            found = Some((k, begin, end, in_filter));
            break;
        }
    }

    let Some((clause, begin, end, in_filter)) = found else {
        let frame = ctx.frame_mut()?;
        frame.flow.pop();
        return match flow.kind {
            FlowKind::Exception(ex) => Ok(StepResult::Unwind(ex)),
            FlowKind::Leave { target } => {
                frame.flow.discard_outside(target);
                Ok(StepResult::Jump(target as usize))
            }
        };
    };

    let frame = ctx.frame_mut()?;
    if let Some(top) = frame.flow.current_mut() {
        top.next_clause = clause + 1;
        top.active = Some(ActiveClause {
            clause,
            begin,
            end,
            in_filter,
        });
    }
    frame.flow.discard_escaped(begin);
    let kind = info.ex_clauses[clause].kind;
    vm_trace_handler!(ctx, handler_name(kind, in_filter), &info.name, begin as usize);
    if let (FlowKind::Exception(ex), ClauseKind::Catch(_) | ClauseKind::Filter { .. }) = (flow.kind, kind) {
        store_exception(ctx, ex)?;
    }
    Ok(StepResult::Jump(begin as usize))
}

fn handler_name(kind: ClauseKind, in_filter: bool) -> &'static str {
    match kind {
        ClauseKind::Catch(_) => "catch",
        ClauseKind::Filter { .. } if in_filter => "filter",
        ClauseKind::Filter { .. } => "filtered catch",
        ClauseKind::Finally => "finally",
        ClauseKind::Fault => "fault",
    }
}

/// Handlers and filters find the exception in the first evaluation slot.
fn store_exception(ctx: &mut ExecContext, ex: ObjectRef) -> Result<(), MemoryError> {
    let at = ctx.base + ctx.method.eval_stack_base_offset as usize;
    ctx.interp
        .machine
        .set_slot(at, StackObject::from_ref(Some(ex)))
}

/// `leave`: run every finally between here and `target`, then jump.
pub(crate) fn leave(ctx: &mut ExecContext, target: u32) -> Result<StepResult, Fault> {
    let offset = ctx.ip as u32;
    let info = ctx.method.clone();
    let frame = ctx.frame_mut()?;
    // leaving a catch handler ends the flow that entered it
    while frame
        .flow
        .current()
        .is_some_and(|f| f.covers(offset) && !f.covers(target))
    {
        frame.flow.pop();
    }
    let needs_finally = info.ex_clauses.iter().any(|c| {
        c.kind == ClauseKind::Finally && c.try_contains(offset) && !c.try_contains(target)
    });
    if !needs_finally {
        frame.flow.discard_outside(target);
        return Ok(StepResult::Jump(target as usize));
    }
    frame
        .flow
        .push(ExceptionFlowInfo::new(FlowKind::Leave { target }, offset));
    continue_search(ctx)
}

pub(crate) fn end_finally(ctx: &mut ExecContext) -> Result<StepResult, Fault> {
    if ctx.frame()?.flow.is_empty() {
        return Err(no_flow(ctx));
    }
    continue_search(ctx)
}

pub(crate) fn end_filter(ctx: &mut ExecContext, accepted: bool) -> Result<StepResult, Fault> {
    let info = ctx.method.clone();
    let flow = ctx.frame()?.flow.current().copied();
    let (ex, active) = match flow {
        Some(ExceptionFlowInfo {
            kind: FlowKind::Exception(ex),
            active: Some(active),
            ..
        }) if active.in_filter => (ex, active),
        _ => return Err(no_flow(ctx)),
    };
    if !accepted {
        if let Some(top) = ctx.frame_mut()?.flow.current_mut() {
            top.active = None;
        }
        return continue_search(ctx);
    }
    let clause = info.ex_clauses[active.clause];
    if let Some(top) = ctx.frame_mut()?.flow.current_mut() {
        top.active = Some(ActiveClause {
            clause: active.clause,
            begin: clause.handler_begin,
            end: clause.handler_end,
            in_filter: false,
        });
    }
    vm_trace_handler!(ctx, handler_name(clause.kind, false), &info.name, clause.handler_begin as usize);
    store_exception(ctx, ex)?;
    Ok(StepResult::Jump(clause.handler_begin as usize))
}

/// `rethrow`: the exception of the catch handler being run.
pub(crate) fn rethrow(ctx: &mut ExecContext) -> Result<StepResult, Fault> {
    let frame = ctx.frame_mut()?;
    match frame.flow.current().map(|f| f.kind) {
        Some(FlowKind::Exception(ex)) => {
            frame.flow.pop();
            Err(Fault::Managed(ex))
        }
        _ => Err(no_flow(ctx)),
    }
}

/// `throw` of a slot value; a null reference raises `NullReferenceException`.
pub(crate) fn throw_value(ctx: &mut ExecContext, value: StackObject) -> Result<StepResult, Fault> {
    match value.as_ref() {
        Some(ex) => Err(Fault::Managed(ex)),
        None => Err(ctx.exception(ExceptionKind::NullReference)),
    }
}

/// Leaves the innermost frame, which had no handler for `ex`, and continues
/// the search in its caller at the call instruction.
pub(crate) fn unwind(ctx: &mut ExecContext, ex: ObjectRef) -> Result<StepResult, ExecuteError> {
    let left = ctx.group.leave_frame(&mut ctx.interp.machine);
    if let Some(frame) = &left {
        vm_trace_method_exit!(ctx, &frame.method.name);
    }
    if ctx.group.is_exhausted(&ctx.interp.machine) {
        return Err(ExecuteError::Unhandled(ex));
    }
    ctx.reload().map_err(VmError::from)?;
    let call_ip = ctx.frame().map_err(VmError::from)?.call_ip;
    ctx.ip = call_ip;
    Ok(throw(ctx, ex, call_ip)?)
}
