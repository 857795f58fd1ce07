use crate::{
    utils::slots_for_bytes,
    value::{SlotValue, StackObject},
    vm::{
        context::ExecContext,
        error::{ExecutionError, Fault, MemoryError},
        frame::RetTarget,
        instructions::misrouted,
        opcodes::{Instruction as I, Slot, Target},
        StepResult,
    },
};

#[inline]
fn jump_if(ctx: &ExecContext, instr: &I, target: Target, taken: bool) -> StepResult {
    vm_trace_branch!(ctx, instr.opcode().name(), target.0 as usize, taken);
    if taken {
        StepResult::Jump(target.0 as usize)
    } else {
        StepResult::Continue
    }
}

#[inline]
fn compare<T: SlotValue>(
    ctx: &ExecContext,
    a: Slot,
    b: Slot,
    op: fn(T, T) -> bool,
) -> Result<bool, MemoryError> {
    Ok(op(ctx.slot(a)?, ctx.slot(b)?))
}

/// Pops the current frame and hands `values` to whoever is waiting for them.
fn return_values(ctx: &mut ExecContext, values: &[StackObject]) -> Result<StepResult, Fault> {
    vm_trace_method_exit!(ctx, &ctx.method.name);
    let frame = ctx
        .group
        .leave_frame(&mut ctx.interp.machine)
        .ok_or_else(|| ExecutionError::CorruptFrame("return without a frame".into()))?;
    match frame.ret {
        RetTarget::Discard => {}
        RetTarget::Slot(at) => ctx.interp.machine.write_slots(at, values)?,
        RetTarget::Host => {
            for (dst, v) in ctx.host_ret().iter_mut().zip(values) {
                *dst = *v;
            }
        }
    }
    Ok(StepResult::Return)
}

pub fn execute(ctx: &mut ExecContext, instr: I) -> Result<StepResult, Fault> {
    let taken = match instr {
        I::Br { target } => return Ok(StepResult::Jump(target.0 as usize)),
        I::BrTrueI4 { cond, target } => (target, ctx.slot::<i32>(cond)? != 0),
        I::BrFalseI4 { cond, target } => (target, ctx.slot::<i32>(cond)? == 0),
        I::BrTrueI8 { cond, target } => (target, ctx.slot::<i64>(cond)? != 0),
        I::BrFalseI8 { cond, target } => (target, ctx.slot::<i64>(cond)? == 0),

        I::BeqI4 { a, b, target } => (target, compare::<i32>(ctx, a, b, |x, y| x == y)?),
        I::BneUnI4 { a, b, target } => (target, compare::<i32>(ctx, a, b, |x, y| x != y)?),
        I::BgeI4 { a, b, target } => (target, compare::<i32>(ctx, a, b, |x, y| x >= y)?),
        I::BgeUnI4 { a, b, target } => (target, compare::<u32>(ctx, a, b, |x, y| x >= y)?),
        I::BgtI4 { a, b, target } => (target, compare::<i32>(ctx, a, b, |x, y| x > y)?),
        I::BgtUnI4 { a, b, target } => (target, compare::<u32>(ctx, a, b, |x, y| x > y)?),
        I::BleI4 { a, b, target } => (target, compare::<i32>(ctx, a, b, |x, y| x <= y)?),
        I::BleUnI4 { a, b, target } => (target, compare::<u32>(ctx, a, b, |x, y| x <= y)?),
        I::BltI4 { a, b, target } => (target, compare::<i32>(ctx, a, b, |x, y| x < y)?),
        I::BltUnI4 { a, b, target } => (target, compare::<u32>(ctx, a, b, |x, y| x < y)?),

        I::BeqI8 { a, b, target } => (target, compare::<i64>(ctx, a, b, |x, y| x == y)?),
        I::BneUnI8 { a, b, target } => (target, compare::<i64>(ctx, a, b, |x, y| x != y)?),
        I::BgeI8 { a, b, target } => (target, compare::<i64>(ctx, a, b, |x, y| x >= y)?),
        I::BgeUnI8 { a, b, target } => (target, compare::<u64>(ctx, a, b, |x, y| x >= y)?),
        I::BgtI8 { a, b, target } => (target, compare::<i64>(ctx, a, b, |x, y| x > y)?),
        I::BgtUnI8 { a, b, target } => (target, compare::<u64>(ctx, a, b, |x, y| x > y)?),
        I::BleI8 { a, b, target } => (target, compare::<i64>(ctx, a, b, |x, y| x <= y)?),
        I::BleUnI8 { a, b, target } => (target, compare::<u64>(ctx, a, b, |x, y| x <= y)?),
        I::BltI8 { a, b, target } => (target, compare::<i64>(ctx, a, b, |x, y| x < y)?),
        I::BltUnI8 { a, b, target } => (target, compare::<u64>(ctx, a, b, |x, y| x < y)?),

        // unordered (`Un`) float branches are taken when either side is NaN
        I::BeqR4 { a, b, target } => (target, compare::<f32>(ctx, a, b, |x, y| x == y)?),
        I::BneUnR4 { a, b, target } => (target, compare::<f32>(ctx, a, b, |x, y| x != y)?),
        I::BgeR4 { a, b, target } => (target, compare::<f32>(ctx, a, b, |x, y| x >= y)?),
        I::BgeUnR4 { a, b, target } => (target, compare::<f32>(ctx, a, b, |x, y| !(x < y))?),
        I::BgtR4 { a, b, target } => (target, compare::<f32>(ctx, a, b, |x, y| x > y)?),
        I::BgtUnR4 { a, b, target } => (target, compare::<f32>(ctx, a, b, |x, y| !(x <= y))?),
        I::BleR4 { a, b, target } => (target, compare::<f32>(ctx, a, b, |x, y| x <= y)?),
        I::BleUnR4 { a, b, target } => (target, compare::<f32>(ctx, a, b, |x, y| !(x > y))?),
        I::BltR4 { a, b, target } => (target, compare::<f32>(ctx, a, b, |x, y| x < y)?),
        I::BltUnR4 { a, b, target } => (target, compare::<f32>(ctx, a, b, |x, y| !(x >= y))?),

        I::BeqR8 { a, b, target } => (target, compare::<f64>(ctx, a, b, |x, y| x == y)?),
        I::BneUnR8 { a, b, target } => (target, compare::<f64>(ctx, a, b, |x, y| x != y)?),
        I::BgeR8 { a, b, target } => (target, compare::<f64>(ctx, a, b, |x, y| x >= y)?),
        I::BgeUnR8 { a, b, target } => (target, compare::<f64>(ctx, a, b, |x, y| !(x < y))?),
        I::BgtR8 { a, b, target } => (target, compare::<f64>(ctx, a, b, |x, y| x > y)?),
        I::BgtUnR8 { a, b, target } => (target, compare::<f64>(ctx, a, b, |x, y| !(x <= y))?),
        I::BleR8 { a, b, target } => (target, compare::<f64>(ctx, a, b, |x, y| x <= y)?),
        I::BleUnR8 { a, b, target } => (target, compare::<f64>(ctx, a, b, |x, y| !(x > y))?),
        I::BltR8 { a, b, target } => (target, compare::<f64>(ctx, a, b, |x, y| x < y)?),
        I::BltUnR8 { a, b, target } => (target, compare::<f64>(ctx, a, b, |x, y| !(x >= y))?),

        I::Switch { value, table } => {
            let index: u32 = ctx.slot(value)?;
            let method = ctx.method.clone();
            // out-of-range values fall through
            return Ok(match method.branch_table(table)?.get(index as usize) {
                Some(&target) => jump_if(ctx, &instr, Target(target), true),
                None => StepResult::Continue,
            });
        }

        I::RetVoid {} => return return_values(ctx, &[]),
        I::Ret { src } => {
            let v = ctx.get(src)?;
            return return_values(ctx, &[v]);
        }
        I::RetN { src, size } => {
            let start = ctx.abs(src)?;
            let values = ctx.interp.machine.slots(start, slots_for_bytes(size as usize))?;
            return return_values(ctx, &values);
        }
        _ => return Err(misrouted(ctx, instr)),
    };
    let (target, cond) = taken;
    Ok(jump_if(ctx, &instr, target, cond))
}
