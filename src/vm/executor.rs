use crate::{
    value::ObjectRef,
    vm::{
        context::ExecContext,
        error::{DecodeError, ExecuteError, ExecutionError, Fault, VmError},
        exceptions,
        instructions::get_handler,
        opcodes::Instruction,
        tracer::TraceEvent,
    },
};

/// What the dispatch loop does after an instruction handler returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// Fall through to the next instruction.
    Continue,
    /// Continue at an absolute offset in the current method.
    Jump(usize),
    /// A callee frame was pushed; start executing it.
    FramePushed,
    /// The current frame was popped; resume the caller at its saved offset.
    Return,
    /// No handler in this frame; leave it and search the caller.
    Unwind(ObjectRef),
}

/// Instructions are counted locally and published to the shared metrics in
/// batches of this size.
const METRICS_BATCH: u64 = 4096;

/// Runs the frames of `ctx`'s group until the outermost one returns.
///
/// Calls between interpreted methods never recurse on the native stack: a
/// call pushes a frame and the loop below simply rebinds to it.
pub(crate) fn run(ctx: &mut ExecContext) -> Result<(), ExecuteError> {
    let rt = ctx.runtime_arc();
    let mut executed = 0u64;
    let mut method = ctx.method.clone();
    vm_trace_method_entry!(ctx, &method, ctx.base);

    let result = 'dispatch: loop {
        if executed >= METRICS_BATCH {
            rt.metrics().record_instructions(executed);
            executed = 0;
        }
        let instr = match Instruction::decode(&method.codes, ctx.ip) {
            Ok(i) => i,
            Err(DecodeError::UnknownOpcode { offset, opcode }) => {
                break Err(ExecutionError::InvalidOpcode { offset, opcode }.into());
            }
            Err(e) => break Err(e.into()),
        };
        executed += 1;
        vm_trace_instruction!(ctx, ctx.ip, &instr);

        let mut step = get_handler(instr.opcode())(ctx, instr);
        let next = loop {
            match step {
                Ok(StepResult::Continue) => break ctx.ip + instr.opcode().size(),
                Ok(StepResult::Jump(target)) => break target,
                Ok(StepResult::FramePushed) => {
                    if let Err(e) = ctx.reload() {
                        break 'dispatch Err(e.into());
                    }
                    method = ctx.method.clone();
                    rt.metrics().record_stack_top(ctx.interp.machine.top());
                    vm_trace_method_entry!(ctx, &method, ctx.base);
                    break ctx.ip;
                }
                Ok(StepResult::Return) => {
                    if ctx.group.is_exhausted(&ctx.interp.machine) {
                        break 'dispatch Ok(());
                    }
                    if let Err(e) = ctx.reload() {
                        break 'dispatch Err(e.into());
                    }
                    method = ctx.method.clone();
                    break ctx.ip;
                }
                Ok(StepResult::Unwind(ex)) => {
                    match exceptions::unwind(ctx, ex) {
                        Ok(s) => step = Ok(s),
                        Err(ExecuteError::Unhandled(ex)) => {
                            rt.metrics().record_instructions(executed);
                            return Err(ExecuteError::Unhandled(ex));
                        }
                        Err(ExecuteError::Vm(e)) => break 'dispatch Err(e),
                    }
                    method = ctx.method.clone();
                }
                Err(Fault::Managed(ex)) => {
                    let at = ctx.ip;
                    step = exceptions::raise(ctx, ex, at);
                }
                Err(Fault::Vm(e)) => break 'dispatch Err(e),
            }
        };
        ctx.ip = next;
    };

    rt.metrics().record_instructions(executed);
    result.map_err(|e: VmError| fatal(ctx, e))
}

/// Discards every frame of the invocation after a fatal error.
fn fatal(ctx: &mut ExecContext, e: VmError) -> ExecuteError {
    vm_error!(ctx, "fatal: {}", e);
    vm_trace_event!(ctx, Debug, TraceEvent::Frame {
        depth: ctx.group.depth(&ctx.interp.machine),
        method: ctx.method.name.clone(),
        ip: ctx.ip,
        base: ctx.base,
        top: ctx.interp.machine.top(),
    });
    tracing::error!(method = %ctx.method.name, ip = ctx.ip, error = %e, "fatal interpreter error");
    ctx.group.unwind_all(&mut ctx.interp.machine);
    ExecuteError::Vm(e)
}
