use crate::{
    runtime::{exceptions::ExceptionKind, init::ensure_initialized, method_from_pointer, method_pointer, Runtime},
    types::{ClassHandle, ClassKind, MethodHandle},
    value::{Address, ObjectRef, StackObject},
    vm::{
        bridge,
        context::ExecContext,
        error::{Fault, TypeResolutionError, VmError},
        instructions::misrouted,
        opcodes::{Instruction as I, Slot},
        StepResult,
    },
};

/// Offsets of the `hasValue` and `value` fields of a `Nullable<T>`.
fn nullable_fields(rt: &Runtime, class: ClassHandle) -> Result<(u32, u32), VmError> {
    let info = rt.class(class)?;
    match (info.field("hasValue"), info.field("value")) {
        (Some(h), Some(v)) => Ok((h.offset, v.offset)),
        _ => Err(TypeResolutionError::InvalidClass(class.0).into()),
    }
}

fn cast_error(ctx: &ExecContext, from: ClassHandle, to: ClassHandle) -> Fault {
    let rt = ctx.runtime();
    let message = format!(
        "Unable to cast object of type '{}' to type '{}'.",
        rt.class(from).map_or("?", |c| c.name.as_str()),
        rt.class(to).map_or("?", |c| c.name.as_str()),
    );
    ctx.exception_with(ExceptionKind::InvalidCast, message)
}

/// Raw instance bytes of a boxed value.
fn box_contents(ctx: &mut ExecContext, obj: ObjectRef, size: usize) -> Result<Vec<u8>, Fault> {
    let mut bytes = vec![0u8; size];
    ctx.memory()
        .read_bytes(Address::Heap { object: obj, offset: 0 }, &mut bytes)?;
    Ok(bytes)
}

fn box_value(ctx: &mut ExecContext, dst: Slot, src: Slot, class: ClassHandle) -> Result<(), Fault> {
    let rt = ctx.runtime_arc();
    let info = rt.class(class)?;
    let boxed = match info.kind {
        ClassKind::Nullable(underlying) => {
            let (has_value, value) = nullable_fields(&rt, class)?;
            let bytes = ctx.slot_bytes(src, info.instance_size as usize)?;
            if bytes[has_value as usize] == 0 {
                None
            } else {
                let size = rt.class(underlying)?.instance_size as usize;
                let start = value as usize;
                Some(rt.box_value(underlying, &bytes[start..start + size])?)
            }
        }
        _ if info.is_value_type() => {
            let bytes = ctx.slot_bytes(src, info.instance_size as usize)?;
            Some(rt.box_value(class, &bytes)?)
        }
        // boxing a reference type is the identity
        _ => ctx.get(src)?.as_ref(),
    };
    ctx.set(dst, StackObject::from_ref(boxed))?;
    Ok(())
}

fn unbox_any(ctx: &mut ExecContext, dst: Slot, obj: Slot, class: ClassHandle) -> Result<(), Fault> {
    let rt = ctx.runtime_arc();
    let info = rt.class(class)?;
    let value = ctx.get(obj)?.as_ref();
    match info.kind {
        ClassKind::Nullable(underlying) => {
            let (has_value, offset) = nullable_fields(&rt, class)?;
            let mut bytes = vec![0u8; info.instance_size as usize];
            if let Some(o) = value {
                let actual = rt.object_class(o)?;
                if actual != underlying {
                    return Err(cast_error(ctx, actual, class));
                }
                let size = rt.class(underlying)?.instance_size as usize;
                let contents = box_contents(ctx, o, size)?;
                bytes[has_value as usize] = 1;
                bytes[offset as usize..offset as usize + size].copy_from_slice(&contents);
            }
            ctx.set_slot_bytes(dst, &bytes)?;
        }
        _ if info.is_value_type() => {
            let Some(o) = value else {
                return Err(ctx.exception(ExceptionKind::NullReference));
            };
            let actual = rt.object_class(o)?;
            if actual != class {
                return Err(cast_error(ctx, actual, class));
            }
            let bytes = box_contents(ctx, o, info.instance_size as usize)?;
            ctx.set_slot_bytes(dst, &bytes)?;
        }
        _ => cast(ctx, dst, obj, class, true)?,
    }
    Ok(())
}

/// `castclass` when `throw` is set, `isinst` otherwise.
fn cast(ctx: &mut ExecContext, dst: Slot, obj: Slot, class: ClassHandle, throw: bool) -> Result<(), Fault> {
    let value = ctx.get(obj)?;
    let Some(o) = value.as_ref() else {
        ctx.set(dst, StackObject::ZERO)?;
        return Ok(());
    };
    let actual = ctx.runtime().object_class(o)?;
    if ctx.runtime().is_assignable(actual, class) {
        ctx.set(dst, value)?;
    } else if throw {
        return Err(cast_error(ctx, actual, class));
    } else {
        ctx.set(dst, StackObject::ZERO)?;
    }
    Ok(())
}

/// Allocates the instance, hands it to the constructor as `this` and runs it.
fn new_object(
    ctx: &mut ExecContext,
    dst: Slot,
    method: MethodHandle,
    arg_base: Slot,
    next: usize,
) -> Result<StepResult, Fault> {
    let rt = ctx.runtime_arc();
    let class = rt.method(method)?.class;
    ensure_initialized(ctx.interp, class)?;
    let obj = StackObject::from_ref(Some(rt.alloc_instance(class)?));
    ctx.set(dst, obj)?;
    ctx.set(arg_base, obj)?;
    bridge::call_method(ctx, method, arg_base, None, next)
}

/// Zeroes the value in place and runs the constructor against its address.
fn new_value_type(
    ctx: &mut ExecContext,
    dst: Slot,
    method: MethodHandle,
    arg_base: Slot,
    next: usize,
) -> Result<StepResult, Fault> {
    let rt = ctx.runtime_arc();
    let size = rt.class(rt.method(method)?.class)?.instance_size as usize;
    ctx.set_slot_bytes(dst, &vec![0u8; size])?;
    let this = ctx.slot_address(dst)?;
    ctx.set(arg_base, StackObject::from_address(Some(this)))?;
    bridge::call_method(ctx, method, arg_base, None, next)
}

pub fn execute(ctx: &mut ExecContext, instr: I) -> Result<StepResult, Fault> {
    let next = ctx.ip + instr.opcode().size();
    match instr {
        I::NewObjNoCtor { dst, class } => {
            ensure_initialized(ctx.interp, class)?;
            let obj = ctx.runtime().alloc_instance(class)?;
            ctx.set(dst, StackObject::from_ref(Some(obj)))?;
        }
        I::NewObjInterp { dst, method, arg_base } | I::NewObjNative { dst, method, arg_base } => {
            return new_object(ctx, dst, method, arg_base, next);
        }
        I::NewValueTypeInterp { dst, method, arg_base }
        | I::NewValueTypeNative { dst, method, arg_base } => {
            return new_value_type(ctx, dst, method, arg_base, next);
        }

        I::Box { dst, src, class } => box_value(ctx, dst, src, class)?,
        I::Unbox { dst, obj, class } => {
            let o = ctx.object(obj)?;
            let rt = ctx.runtime_arc();
            let expected = match rt.class(class)?.kind {
                ClassKind::Nullable(underlying) => underlying,
                _ => class,
            };
            let actual = rt.object_class(o)?;
            if actual != expected {
                return Err(cast_error(ctx, actual, class));
            }
            let addr = Address::Heap { object: o, offset: 0 };
            ctx.set(dst, StackObject::from_address(Some(addr)))?;
        }
        I::UnboxAny { dst, obj, class } => unbox_any(ctx, dst, obj, class)?,
        I::CastClass { dst, obj, class } => cast(ctx, dst, obj, class, true)?,
        I::IsInst { dst, obj, class } => cast(ctx, dst, obj, class, false)?,

        I::Ldstr { dst, literal } => {
            let s = ctx.runtime().intern(ctx.method.string(literal)?);
            ctx.set(dst, StackObject::from_ref(Some(s)))?;
        }
        I::NewDelegate { dst, class, receiver, fnptr } => {
            let Some(method) = method_from_pointer(ctx.get(fnptr)?) else {
                return Err(ctx.exception(ExceptionKind::NullReference));
            };
            let target = ctx.get(receiver)?.as_ref();
            let d = ctx.runtime().new_delegate(class, target, method)?;
            ctx.set(dst, StackObject::from_ref(Some(d)))?;
        }
        I::Ldftn { dst, method } => ctx.set(dst, method_pointer(method))?,
        I::Ldvirtftn { dst, obj, method } => {
            let o = ctx.object(obj)?;
            let rt = ctx.runtime_arc();
            let target = rt.resolve_virtual(rt.object_class(o)?, method)?;
            ctx.set(dst, method_pointer(target))?;
        }
        _ => return Err(misrouted(ctx, instr)),
    }
    Ok(StepResult::Continue)
}
