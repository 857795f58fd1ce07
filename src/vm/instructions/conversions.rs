use crate::{
    runtime::exceptions::ExceptionKind,
    vm::{
        context::ExecContext,
        error::{Fault, MemoryError},
        instructions::misrouted,
        opcodes::{Instruction as I, NumKind, Slot},
        StepResult,
    },
};

/// A source operand read at its stack width; integers are widened losslessly.
#[derive(Clone, Copy, Debug)]
enum Num {
    Int(i128),
    Float(f64),
}

fn load(ctx: &ExecContext, src: Slot, from: NumKind) -> Result<Num, MemoryError> {
    Ok(match from {
        NumKind::I1 | NumKind::I2 | NumKind::I4 => Num::Int(ctx.slot::<i32>(src)? as i128),
        NumKind::U1 | NumKind::U2 | NumKind::U4 => Num::Int(ctx.slot::<u32>(src)? as i128),
        NumKind::I8 => Num::Int(ctx.slot::<i64>(src)? as i128),
        NumKind::U8 => Num::Int(ctx.slot::<u64>(src)? as i128),
        NumKind::R4 => Num::Float(ctx.slot::<f32>(src)? as f64),
        NumKind::R8 => Num::Float(ctx.slot::<f64>(src)?),
    })
}

fn range(to: NumKind) -> (i128, i128) {
    match to {
        NumKind::I1 => (i8::MIN as i128, i8::MAX as i128),
        NumKind::U1 => (0, u8::MAX as i128),
        NumKind::I2 => (i16::MIN as i128, i16::MAX as i128),
        NumKind::U2 => (0, u16::MAX as i128),
        NumKind::I4 => (i32::MIN as i128, i32::MAX as i128),
        NumKind::U4 => (0, u32::MAX as i128),
        NumKind::I8 => (i64::MIN as i128, i64::MAX as i128),
        NumKind::U8 => (0, u64::MAX as i128),
        NumKind::R4 | NumKind::R8 => (i128::MIN, i128::MAX),
    }
}

/// Stores an integer truncated to `to`, extended back to stack width.
fn store_int(ctx: &mut ExecContext, dst: Slot, to: NumKind, v: i128) -> Result<(), MemoryError> {
    match to {
        NumKind::I1 => ctx.set_slot(dst, v as i8 as i32),
        NumKind::U1 => ctx.set_slot(dst, v as u8 as i32),
        NumKind::I2 => ctx.set_slot(dst, v as i16 as i32),
        NumKind::U2 => ctx.set_slot(dst, v as u16 as i32),
        NumKind::I4 | NumKind::U4 => ctx.set_slot(dst, v as u32),
        NumKind::I8 | NumKind::U8 => ctx.set_slot(dst, v as u64),
        NumKind::R4 => ctx.set_slot(dst, v as f32),
        NumKind::R8 => ctx.set_slot(dst, v as f64),
    }
}

fn store(ctx: &mut ExecContext, dst: Slot, to: NumKind, n: Num) -> Result<(), MemoryError> {
    match (n, to) {
        (Num::Int(v), _) => store_int(ctx, dst, to, v),
        (Num::Float(f), NumKind::R4) => ctx.set_slot(dst, f as f32),
        (Num::Float(f), NumKind::R8) => ctx.set_slot(dst, f),
        // float to integer saturates; out-of-range results are unspecified
        (Num::Float(f), NumKind::U8) => ctx.set_slot(dst, f as u64),
        (Num::Float(f), NumKind::U4) => ctx.set_slot(dst, f as u32),
        (Num::Float(f), _) => store_int(ctx, dst, to, f as i64 as i128),
    }
}

fn checked(n: Num, to: NumKind) -> Option<Num> {
    let (lo, hi) = range(to);
    match n {
        Num::Int(v) => (lo..=hi).contains(&v).then_some(n),
        Num::Float(_) if to.is_float() => Some(n),
        Num::Float(f) => {
            if f.is_nan() {
                return None;
            }
            let t = f.trunc();
            // `hi + 1` is a power of two and exact in f64; `hi` itself may not be
            (t >= lo as f64 && t < hi as f64 + 1.0).then_some(Num::Int(t as i128))
        }
    }
}

pub fn execute(ctx: &mut ExecContext, instr: I) -> Result<StepResult, Fault> {
    match instr {
        I::Conv { dst, src, from, to } => {
            let n = load(ctx, src, from)?;
            store(ctx, dst, to, n)?;
        }
        I::ConvOvf { dst, src, from, to } => {
            let n = load(ctx, src, from)?;
            match checked(n, to) {
                Some(n) => store(ctx, dst, to, n)?,
                None => return Err(ctx.exception(ExceptionKind::Overflow)),
            }
        }
        I::CheckFiniteR4 { src } => {
            if !ctx.slot::<f32>(src)?.is_finite() {
                return Err(ctx.exception(ExceptionKind::Arithmetic));
            }
        }
        I::CheckFiniteR8 { src } => {
            if !ctx.slot::<f64>(src)?.is_finite() {
                return Err(ctx.exception(ExceptionKind::Arithmetic));
            }
        }
        _ => return Err(misrouted(ctx, instr)),
    }
    Ok(StepResult::Continue)
}
