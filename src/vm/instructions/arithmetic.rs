use crate::{
    runtime::exceptions::ExceptionKind,
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
fn binary<T: SlotValue>(
    ctx: &mut ExecContext,
    dst: Slot,
    a: Slot,
    b: Slot,
    op: fn(T, T) -> T,
) -> Result<(), MemoryError> {
    let x: T = ctx.slot(a)?;
    let y: T = ctx.slot(b)?;
    ctx.set_slot(dst, op(x, y))
}

#[inline]
fn unary<T: SlotValue>(
    ctx: &mut ExecContext,
    dst: Slot,
    src: Slot,
    op: fn(T) -> T,
) -> Result<(), MemoryError> {
    let x: T = ctx.slot(src)?;
    ctx.set_slot(dst, op(x))
}

/// Checked operation; `None` from `op` raises `OverflowException`.
#[inline]
fn checked<T: SlotValue>(
    ctx: &mut ExecContext,
    dst: Slot,
    a: Slot,
    b: Slot,
    op: fn(T, T) -> Option<T>,
) -> Result<(), Fault> {
    let x: T = ctx.slot(a)?;
    let y: T = ctx.slot(b)?;
    match op(x, y) {
        Some(v) => Ok(ctx.set_slot(dst, v)?),
        None => Err(ctx.exception(ExceptionKind::Overflow)),
    }
}

/// Integer division and remainder: a zero divisor raises
/// `DivideByZeroException`, `MIN / -1` raises `OverflowException`.
#[inline]
fn divide<T: SlotValue + PartialEq + Default>(
    ctx: &mut ExecContext,
    dst: Slot,
    a: Slot,
    b: Slot,
    op: fn(T, T) -> Option<T>,
) -> Result<(), Fault> {
    let y: T = ctx.slot(b)?;
    if y == T::default() {
        return Err(ctx.exception(ExceptionKind::DivideByZero));
    }
    checked(ctx, dst, a, b, op)
}

pub fn execute(ctx: &mut ExecContext, instr: I) -> Result<StepResult, Fault> {
    match instr {
        I::AddI4 { dst, a, b } => binary::<i32>(ctx, dst, a, b, i32::wrapping_add)?,
        I::SubI4 { dst, a, b } => binary::<i32>(ctx, dst, a, b, i32::wrapping_sub)?,
        I::MulI4 { dst, a, b } => binary::<i32>(ctx, dst, a, b, i32::wrapping_mul)?,
        I::DivI4 { dst, a, b } => divide::<i32>(ctx, dst, a, b, i32::checked_div)?,
        I::DivUnI4 { dst, a, b } => divide::<u32>(ctx, dst, a, b, u32::checked_div)?,
        I::RemI4 { dst, a, b } => divide::<i32>(ctx, dst, a, b, i32::checked_rem)?,
        I::RemUnI4 { dst, a, b } => divide::<u32>(ctx, dst, a, b, u32::checked_rem)?,
        I::AndI4 { dst, a, b } => binary::<i32>(ctx, dst, a, b, |x, y| x & y)?,
        I::OrI4 { dst, a, b } => binary::<i32>(ctx, dst, a, b, |x, y| x | y)?,
        I::XorI4 { dst, a, b } => binary::<i32>(ctx, dst, a, b, |x, y| x ^ y)?,
        I::ShlI4 { dst, a, b } => binary::<i32>(ctx, dst, a, b, |x, y| x.wrapping_shl(y as u32))?,
        I::ShrI4 { dst, a, b } => binary::<i32>(ctx, dst, a, b, |x, y| x.wrapping_shr(y as u32))?,
        I::ShrUnI4 { dst, a, b } => binary::<u32>(ctx, dst, a, b, |x, y| x.wrapping_shr(y))?,

        I::AddI8 { dst, a, b } => binary::<i64>(ctx, dst, a, b, i64::wrapping_add)?,
        I::SubI8 { dst, a, b } => binary::<i64>(ctx, dst, a, b, i64::wrapping_sub)?,
        I::MulI8 { dst, a, b } => binary::<i64>(ctx, dst, a, b, i64::wrapping_mul)?,
        I::DivI8 { dst, a, b } => divide::<i64>(ctx, dst, a, b, i64::checked_div)?,
        I::DivUnI8 { dst, a, b } => divide::<u64>(ctx, dst, a, b, u64::checked_div)?,
        I::RemI8 { dst, a, b } => divide::<i64>(ctx, dst, a, b, i64::checked_rem)?,
        I::RemUnI8 { dst, a, b } => divide::<u64>(ctx, dst, a, b, u64::checked_rem)?,
        I::AndI8 { dst, a, b } => binary::<i64>(ctx, dst, a, b, |x, y| x & y)?,
        I::OrI8 { dst, a, b } => binary::<i64>(ctx, dst, a, b, |x, y| x | y)?,
        I::XorI8 { dst, a, b } => binary::<i64>(ctx, dst, a, b, |x, y| x ^ y)?,
        // shift counts are int32 operands
        I::ShlI8 { dst, a, b } => {
            let n: u32 = ctx.slot(b)?;
            let x: i64 = ctx.slot(a)?;
            ctx.set_slot(dst, x.wrapping_shl(n))?;
        }
        I::ShrI8 { dst, a, b } => {
            let n: u32 = ctx.slot(b)?;
            let x: i64 = ctx.slot(a)?;
            ctx.set_slot(dst, x.wrapping_shr(n))?;
        }
        I::ShrUnI8 { dst, a, b } => {
            let n: u32 = ctx.slot(b)?;
            let x: u64 = ctx.slot(a)?;
            ctx.set_slot(dst, x.wrapping_shr(n))?;
        }

        I::AddR4 { dst, a, b } => binary::<f32>(ctx, dst, a, b, |x, y| x + y)?,
        I::SubR4 { dst, a, b } => binary::<f32>(ctx, dst, a, b, |x, y| x - y)?,
        I::MulR4 { dst, a, b } => binary::<f32>(ctx, dst, a, b, |x, y| x * y)?,
        I::DivR4 { dst, a, b } => binary::<f32>(ctx, dst, a, b, |x, y| x / y)?,
        I::RemR4 { dst, a, b } => binary::<f32>(ctx, dst, a, b, |x, y| x % y)?,
        I::AddR8 { dst, a, b } => binary::<f64>(ctx, dst, a, b, |x, y| x + y)?,
        I::SubR8 { dst, a, b } => binary::<f64>(ctx, dst, a, b, |x, y| x - y)?,
        I::MulR8 { dst, a, b } => binary::<f64>(ctx, dst, a, b, |x, y| x * y)?,
        I::DivR8 { dst, a, b } => binary::<f64>(ctx, dst, a, b, |x, y| x / y)?,
        I::RemR8 { dst, a, b } => binary::<f64>(ctx, dst, a, b, |x, y| x % y)?,

        I::AddOvfI4 { dst, a, b } => checked::<i32>(ctx, dst, a, b, i32::checked_add)?,
        I::AddOvfUnI4 { dst, a, b } => checked::<u32>(ctx, dst, a, b, u32::checked_add)?,
        I::SubOvfI4 { dst, a, b } => checked::<i32>(ctx, dst, a, b, i32::checked_sub)?,
        I::SubOvfUnI4 { dst, a, b } => checked::<u32>(ctx, dst, a, b, u32::checked_sub)?,
        I::MulOvfI4 { dst, a, b } => checked::<i32>(ctx, dst, a, b, i32::checked_mul)?,
        I::MulOvfUnI4 { dst, a, b } => checked::<u32>(ctx, dst, a, b, u32::checked_mul)?,
        I::AddOvfI8 { dst, a, b } => checked::<i64>(ctx, dst, a, b, i64::checked_add)?,
        I::AddOvfUnI8 { dst, a, b } => checked::<u64>(ctx, dst, a, b, u64::checked_add)?,
        I::SubOvfI8 { dst, a, b } => checked::<i64>(ctx, dst, a, b, i64::checked_sub)?,
        I::SubOvfUnI8 { dst, a, b } => checked::<u64>(ctx, dst, a, b, u64::checked_sub)?,
        I::MulOvfI8 { dst, a, b } => checked::<i64>(ctx, dst, a, b, i64::checked_mul)?,
        I::MulOvfUnI8 { dst, a, b } => checked::<u64>(ctx, dst, a, b, u64::checked_mul)?,

        I::NegI4 { dst, src } => unary::<i32>(ctx, dst, src, i32::wrapping_neg)?,
        I::NegI8 { dst, src } => unary::<i64>(ctx, dst, src, i64::wrapping_neg)?,
        I::NegR4 { dst, src } => unary::<f32>(ctx, dst, src, |x| -x)?,
        I::NegR8 { dst, src } => unary::<f64>(ctx, dst, src, |x| -x)?,
        I::NotI4 { dst, src } => unary::<i32>(ctx, dst, src, |x| !x)?,
        I::NotI8 { dst, src } => unary::<i64>(ctx, dst, src, |x| !x)?,
        _ => return Err(misrouted(ctx, instr)),
    }
    Ok(StepResult::Continue)
}
