use crate::{
    value::SlotValue,
    vm::{
        context::ExecContext,
        error::{Fault, MemoryError},
        instructions::misrouted,
        opcodes::{Instruction as I, Slot},
        StepResult,
    },
};

#[inline]
fn compare<T: SlotValue>(
    ctx: &mut ExecContext,
    dst: Slot,
    a: Slot,
    b: Slot,
    op: fn(T, T) -> bool,
) -> Result<(), MemoryError> {
    let x: T = ctx.slot(a)?;
    let y: T = ctx.slot(b)?;
    ctx.set_slot(dst, op(x, y) as i32)
}

pub fn execute(ctx: &mut ExecContext, instr: I) -> Result<StepResult, Fault> {
    match instr {
        I::CeqI4 { dst, a, b } => compare::<i32>(ctx, dst, a, b, |x, y| x == y)?,
        I::CgtI4 { dst, a, b } => compare::<i32>(ctx, dst, a, b, |x, y| x > y)?,
        I::CgtUnI4 { dst, a, b } => compare::<u32>(ctx, dst, a, b, |x, y| x > y)?,
        I::CltI4 { dst, a, b } => compare::<i32>(ctx, dst, a, b, |x, y| x < y)?,
        I::CltUnI4 { dst, a, b } => compare::<u32>(ctx, dst, a, b, |x, y| x < y)?,
        I::CeqI8 { dst, a, b } => compare::<i64>(ctx, dst, a, b, |x, y| x == y)?,
        I::CgtI8 { dst, a, b } => compare::<i64>(ctx, dst, a, b, |x, y| x > y)?,
        I::CgtUnI8 { dst, a, b } => compare::<u64>(ctx, dst, a, b, |x, y| x > y)?,
        I::CltI8 { dst, a, b } => compare::<i64>(ctx, dst, a, b, |x, y| x < y)?,
        I::CltUnI8 { dst, a, b } => compare::<u64>(ctx, dst, a, b, |x, y| x < y)?,

        // `Un` float comparisons also hold when either side is NaN
        I::CeqR4 { dst, a, b } => compare::<f32>(ctx, dst, a, b, |x, y| x == y)?,
        I::CgtR4 { dst, a, b } => compare::<f32>(ctx, dst, a, b, |x, y| x > y)?,
        I::CgtUnR4 { dst, a, b } => compare::<f32>(ctx, dst, a, b, |x, y| !(x <= y))?,
        I::CltR4 { dst, a, b } => compare::<f32>(ctx, dst, a, b, |x, y| x < y)?,
        I::CltUnR4 { dst, a, b } => compare::<f32>(ctx, dst, a, b, |x, y| !(x >= y))?,
        I::CeqR8 { dst, a, b } => compare::<f64>(ctx, dst, a, b, |x, y| x == y)?,
        I::CgtR8 { dst, a, b } => compare::<f64>(ctx, dst, a, b, |x, y| x > y)?,
        I::CgtUnR8 { dst, a, b } => compare::<f64>(ctx, dst, a, b, |x, y| !(x <= y))?,
        I::CltR8 { dst, a, b } => compare::<f64>(ctx, dst, a, b, |x, y| x < y)?,
        I::CltUnR8 { dst, a, b } => compare::<f64>(ctx, dst, a, b, |x, y| !(x >= y))?,
        _ => return Err(misrouted(ctx, instr)),
    }
    Ok(StepResult::Continue)
}
