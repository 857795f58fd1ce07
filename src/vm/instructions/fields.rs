use crate::{
    runtime::init::ensure_initialized,
    types::ClassHandle,
    value::{Address, ObjectRef, SlotValue, StackObject},
    vm::{
        context::ExecContext,
        error::{Fault, MemoryError},
        instructions::misrouted,
        opcodes::{Instruction as I, Slot},
        StepResult,
    },
};

#[inline]
pub(super) fn load<T: SlotValue, W: SlotValue>(
    ctx: &mut ExecContext,
    dst: Slot,
    at: Address,
    widen: fn(T) -> W,
) -> Result<(), Fault> {
    let v: T = ctx.memory().read(at)?;
    ctx.set_slot(dst, widen(v))?;
    Ok(())
}

#[inline]
pub(super) fn store<T: SlotValue>(ctx: &mut ExecContext, at: Address, src: Slot) -> Result<(), Fault> {
    let v: T = ctx.slot(src)?;
    ctx.memory().write(at, v)?;
    Ok(())
}

pub(super) fn store_ref(ctx: &mut ExecContext, at: Address, src: Slot) -> Result<(), Fault> {
    let v: Option<ObjectRef> = ctx.slot(src)?;
    ctx.memory().write_ref(at, v)?;
    Ok(())
}

pub(super) fn load_n(ctx: &mut ExecContext, dst: Slot, at: Address, size: u16) -> Result<(), Fault> {
    let mut bytes = vec![0u8; size as usize];
    ctx.memory().read_bytes(at, &mut bytes)?;
    ctx.set_slot_bytes(dst, &bytes)?;
    Ok(())
}

pub(super) fn store_n(ctx: &mut ExecContext, at: Address, src: Slot, size: u16) -> Result<(), Fault> {
    let bytes = ctx.slot_bytes(src, size as usize)?;
    ctx.memory().write_bytes(at, &bytes, true)?;
    Ok(())
}

/// Field inside a value type held inline in frame slots.
fn inline_field(ctx: &ExecContext, src: Slot, offset: u32) -> Result<Address, MemoryError> {
    Ok(ctx.slot_address(src)?.offset_by(offset as isize))
}

/// Static storage runs the class constructor before its first access.
fn static_field(ctx: &mut ExecContext, class: ClassHandle, offset: u32) -> Result<Address, Fault> {
    ensure_initialized(ctx.interp, class)?;
    Ok(Address::Static { class, offset })
}

fn thread_static_field(ctx: &mut ExecContext, class: ClassHandle, offset: u32) -> Result<Address, Fault> {
    ensure_initialized(ctx.interp, class)?;
    Ok(Address::ThreadStatic { class, offset })
}

pub fn execute(ctx: &mut ExecContext, instr: I) -> Result<StepResult, Fault> {
    match instr {
        I::LdfldI1 { dst, obj, offset } => {
            let at = ctx.field_address(obj, offset)?;
            load::<i8, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdfldU1 { dst, obj, offset } => {
            let at = ctx.field_address(obj, offset)?;
            load::<u8, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdfldI2 { dst, obj, offset } => {
            let at = ctx.field_address(obj, offset)?;
            load::<i16, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdfldU2 { dst, obj, offset } => {
            let at = ctx.field_address(obj, offset)?;
            load::<u16, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdfldI4 { dst, obj, offset } => {
            let at = ctx.field_address(obj, offset)?;
            load::<i32, i32>(ctx, dst, at, |v| v)?
        }
        I::LdfldI8 { dst, obj, offset } => {
            let at = ctx.field_address(obj, offset)?;
            load::<u64, u64>(ctx, dst, at, |v| v)?
        }
        I::LdfldN { dst, obj, offset, size } => {
            let at = ctx.field_address(obj, offset)?;
            load_n(ctx, dst, at, size)?
        }

        I::LdvfldI1 { dst, src, offset } => {
            let at = inline_field(ctx, src, offset)?;
            load::<i8, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdvfldU1 { dst, src, offset } => {
            let at = inline_field(ctx, src, offset)?;
            load::<u8, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdvfldI2 { dst, src, offset } => {
            let at = inline_field(ctx, src, offset)?;
            load::<i16, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdvfldU2 { dst, src, offset } => {
            let at = inline_field(ctx, src, offset)?;
            load::<u16, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdvfldI4 { dst, src, offset } => {
            let at = inline_field(ctx, src, offset)?;
            load::<i32, i32>(ctx, dst, at, |v| v)?
        }
        I::LdvfldI8 { dst, src, offset } => {
            let at = inline_field(ctx, src, offset)?;
            load::<u64, u64>(ctx, dst, at, |v| v)?
        }
        I::LdvfldN { dst, src, offset, size } => {
            let at = inline_field(ctx, src, offset)?;
            load_n(ctx, dst, at, size)?
        }

        I::Ldflda { dst, obj, offset } => {
            let at = ctx.field_address(obj, offset)?;
            ctx.set(dst, StackObject::from_address(Some(at)))?;
        }
        I::StfldI1 { obj, offset, src } => {
            let at = ctx.field_address(obj, offset)?;
            store::<i8>(ctx, at, src)?
        }
        I::StfldI2 { obj, offset, src } => {
            let at = ctx.field_address(obj, offset)?;
            store::<i16>(ctx, at, src)?
        }
        I::StfldI4 { obj, offset, src } => {
            let at = ctx.field_address(obj, offset)?;
            store::<i32>(ctx, at, src)?
        }
        I::StfldI8 { obj, offset, src } => {
            let at = ctx.field_address(obj, offset)?;
            store::<u64>(ctx, at, src)?
        }
        I::StfldRef { obj, offset, src } => {
            let at = ctx.field_address(obj, offset)?;
            store_ref(ctx, at, src)?
        }
        I::StfldN { obj, offset, src, size } => {
            let at = ctx.field_address(obj, offset)?;
            store_n(ctx, at, src, size)?
        }

        I::LdsfldI1 { dst, class, offset } => {
            let at = static_field(ctx, class, offset)?;
            load::<i8, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdsfldU1 { dst, class, offset } => {
            let at = static_field(ctx, class, offset)?;
            load::<u8, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdsfldI2 { dst, class, offset } => {
            let at = static_field(ctx, class, offset)?;
            load::<i16, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdsfldU2 { dst, class, offset } => {
            let at = static_field(ctx, class, offset)?;
            load::<u16, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdsfldI4 { dst, class, offset } => {
            let at = static_field(ctx, class, offset)?;
            load::<i32, i32>(ctx, dst, at, |v| v)?
        }
        I::LdsfldI8 { dst, class, offset } => {
            let at = static_field(ctx, class, offset)?;
            load::<u64, u64>(ctx, dst, at, |v| v)?
        }
        I::LdsfldN { dst, class, offset, size } => {
            let at = static_field(ctx, class, offset)?;
            load_n(ctx, dst, at, size)?
        }
        I::StsfldI1 { class, offset, src } => {
            let at = static_field(ctx, class, offset)?;
            store::<i8>(ctx, at, src)?
        }
        I::StsfldI2 { class, offset, src } => {
            let at = static_field(ctx, class, offset)?;
            store::<i16>(ctx, at, src)?
        }
        I::StsfldI4 { class, offset, src } => {
            let at = static_field(ctx, class, offset)?;
            store::<i32>(ctx, at, src)?
        }
        I::StsfldI8 { class, offset, src } => {
            let at = static_field(ctx, class, offset)?;
            store::<u64>(ctx, at, src)?
        }
        I::StsfldRef { class, offset, src } => {
            let at = static_field(ctx, class, offset)?;
            store_ref(ctx, at, src)?
        }
        I::StsfldN { class, offset, src, size } => {
            let at = static_field(ctx, class, offset)?;
            store_n(ctx, at, src, size)?
        }
        I::Ldsflda { dst, class, offset } => {
            let at = static_field(ctx, class, offset)?;
            ctx.set(dst, StackObject::from_address(Some(at)))?;
        }

        I::LdtsfldI4 { dst, class, offset } => {
            let at = thread_static_field(ctx, class, offset)?;
            load::<i32, i32>(ctx, dst, at, |v| v)?
        }
        I::LdtsfldI8 { dst, class, offset } => {
            let at = thread_static_field(ctx, class, offset)?;
            load::<u64, u64>(ctx, dst, at, |v| v)?
        }
        I::LdtsfldN { dst, class, offset, size } => {
            let at = thread_static_field(ctx, class, offset)?;
            load_n(ctx, dst, at, size)?
        }
        I::SttsfldI4 { class, offset, src } => {
            let at = thread_static_field(ctx, class, offset)?;
            store::<i32>(ctx, at, src)?
        }
        I::SttsfldI8 { class, offset, src } => {
            let at = thread_static_field(ctx, class, offset)?;
            store::<u64>(ctx, at, src)?
        }
        I::SttsfldRef { class, offset, src } => {
            let at = thread_static_field(ctx, class, offset)?;
            store_ref(ctx, at, src)?
        }
        I::SttsfldN { class, offset, src, size } => {
            let at = thread_static_field(ctx, class, offset)?;
            store_n(ctx, at, src, size)?
        }
        I::Ldtsflda { dst, class, offset } => {
            let at = thread_static_field(ctx, class, offset)?;
            ctx.set(dst, StackObject::from_address(Some(at)))?;
        }
        _ => return Err(misrouted(ctx, instr)),
    }
    Ok(StepResult::Continue)
}
