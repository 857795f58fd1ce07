//! Call bridging between interpreted frames, native Rust functions and
//! foreign C functions.
//!
//! Interpreted callees are entered in place: the caller has already laid the
//! arguments out in frame layout at `arg_base`, so the callee frame simply
//! starts there. Native and foreign callees take host layout instead, where a
//! value type classified as [`LocationKind::Indirect`] is passed as the
//! address of the caller's inline copy.
use crate::{
    runtime::{exceptions::ExceptionKind, init::ensure_initialized, method_from_pointer, Runtime},
    types::{MethodBody, MethodHandle, TypeDesc},
    utils::SLOT_SIZE,
    value::{Address, ObjectRef, StackObject},
    vm::{
        abi::{self, LocationKind, TargetAbi},
        context::ExecContext,
        error::{ExecuteError, Fault, MemoryError, NativeError, TypeResolutionError, VmError},
        frame::{ArgSource, RetTarget},
        memory::Memory,
        method_info::{ArgDesc, InterpMethodInfo},
        opcodes::Slot,
        pinvoke, Interpreter, StepResult,
    },
};
use std::sync::Arc;

/// Converts host-layout arguments into frame layout: small integers are
/// widened and by-reference value types are copied inline.
pub(crate) fn copy_args(
    mem: &mut Memory,
    descs: &[ArgDesc],
    args: &[StackObject],
) -> Result<Vec<StackObject>, VmError> {
    let mut out = Vec::with_capacity(descs.iter().map(|d| d.slots as usize).sum());
    let mut cursor = 0;
    for d in descs {
        match d.kind {
            LocationKind::Indirect(size) => {
                let addr = args
                    .get(cursor)
                    .copied()
                    .map(StackObject::as_address)
                    .transpose()?
                    .flatten()
                    .ok_or(NativeError::Unsupported("null by-reference struct".into()))?;
                let mut bytes = vec![0u8; d.slots as usize * SLOT_SIZE];
                mem.read_bytes(addr, &mut bytes[..size as usize])?;
                out.extend(bytes.chunks_exact(SLOT_SIZE).map(|c| {
                    let mut w = [0u8; SLOT_SIZE];
                    w.copy_from_slice(c);
                    StackObject(u64::from_le_bytes(w))
                }));
                cursor += 1;
            }
            kind if kind.needs_fixup() => {
                out.push(kind.widen(args.get(cursor).copied().unwrap_or_default()));
                cursor += 1;
            }
            _ => {
                let n = d.slots as usize;
                out.extend(args.iter().skip(cursor).take(n).copied());
                cursor += n;
            }
        }
    }
    Ok(out)
}

/// Host-layout view of frame-layout arguments starting at absolute slot `base`.
fn host_args(
    machine: &crate::vm::stack::MachineState,
    descs: &[ArgDesc],
    base: usize,
) -> Result<Vec<StackObject>, MemoryError> {
    let mut out = Vec::with_capacity(descs.len());
    let mut slot = base;
    for d in descs {
        match d.kind {
            LocationKind::Indirect(_) => {
                out.push(StackObject::from_address(Some(Address::Stack(slot * SLOT_SIZE))))
            }
            _ => out.extend(machine.slots(slot, d.slots as usize)?),
        }
        slot += d.slots as usize;
    }
    Ok(out)
}

fn ret_desc(rt: &Runtime, ret: TypeDesc) -> Result<Option<ArgDesc>, TypeResolutionError> {
    if ret == TypeDesc::Void {
        return Ok(None);
    }
    abi::describe_type(rt, TargetAbi::host(), ret).map(Some)
}

/// Runs a native or foreign body with host-layout arguments.
pub(crate) fn call_host_native(
    interp: &mut Interpreter,
    method: MethodHandle,
    args: &[StackObject],
    ret: &mut [StackObject],
) -> Result<(), Fault> {
    let rt = interp.runtime().clone();
    let desc = rt.method(method)?;
    let ret_kind = ret_desc(&rt, desc.ret)?;
    let mut buf = vec![StackObject::default(); ret_kind.map_or(1, |d| d.slots.max(1) as usize)];
    vm_debug!(interp, "host call {} ({:?})", rt.method_name(method), desc.body);
    match &desc.body {
        MethodBody::Native(f) => {
            let f = f.clone();
            rt.metrics().record_native_call();
            f(interp, args, &mut buf)?;
        }
        MethodBody::Foreign(_) => pinvoke::call_foreign(interp, method, args, &mut buf)?,
        _ => return Err(NativeError::Unsupported(rt.method_name(method)).into()),
    }
    if let Some(d) = ret_kind {
        buf[0] = d.kind.widen(buf[0]);
    }
    for (dst, src) in ret.iter_mut().zip(&buf) {
        *dst = *src;
    }
    Ok(())
}

/// Native call whose frame-layout arguments sit at absolute slot `base`.
fn call_native_at(
    interp: &mut Interpreter,
    method: MethodHandle,
    base: usize,
    ret: &mut [StackObject],
) -> Result<(), Fault> {
    let rt = interp.runtime().clone();
    let descs = abi::describe_args(&rt, TargetAbi::host(), rt.method(method)?)?;
    let args = host_args(&interp.machine, &descs, base)?;
    call_host_native(interp, method, &args, ret)
}

/// Records where the current frame resumes once a callee returns.
fn save_caller(ctx: &mut ExecContext, next: usize) -> Result<(), Fault> {
    let call_ip = ctx.ip;
    let frame = ctx.frame_mut()?;
    frame.ip = next;
    frame.call_ip = call_ip;
    Ok(())
}

/// Pushes an interpreted callee over the argument region at `arg_base`.
fn call_interp(
    ctx: &mut ExecContext,
    info: Arc<InterpMethodInfo>,
    arg_base: Slot,
    ret: Option<Slot>,
    next: usize,
) -> Result<StepResult, Fault> {
    save_caller(ctx, next)?;
    let base = ctx.abs(arg_base)?;
    let ret = match ret {
        Some(r) => RetTarget::Slot(ctx.abs(r)?),
        None => RetTarget::Discard,
    };
    ctx.group
        .enter_frame(&mut ctx.interp.machine, info, ArgSource::InPlace(base), ret)?;
    ctx.runtime().metrics().record_frame_entered();
    Ok(StepResult::FramePushed)
}

fn call_native(
    ctx: &mut ExecContext,
    method: MethodHandle,
    arg_base: Slot,
    ret: Option<Slot>,
) -> Result<StepResult, Fault> {
    let base = ctx.abs(arg_base)?;
    let rt = ctx.runtime_arc();
    let slots = ret_desc(&rt, rt.method(method)?.ret)?.map_or(0, |d| d.slots as usize);
    let mut buf = vec![StackObject::default(); slots.max(1)];
    call_native_at(ctx.interp, method, base, &mut buf)?;
    if let Some(r) = ret {
        let at = ctx.abs(r)?;
        ctx.interp.machine.write_slots(at, &buf[..slots])?;
    }
    Ok(StepResult::Continue)
}

/// Calls `method` with frame-layout arguments at `arg_base`, choosing the
/// interpreted or native path from its body.
pub(crate) fn call_method(
    ctx: &mut ExecContext,
    method: MethodHandle,
    arg_base: Slot,
    ret: Option<Slot>,
    next: usize,
) -> Result<StepResult, Fault> {
    let rt = ctx.runtime_arc();
    let desc = rt.method(method)?;
    if desc.flags.is_static || desc.flags.is_ctor {
        ensure_initialized(ctx.interp, desc.class)?;
    }
    match desc.body {
        MethodBody::Native(_) | MethodBody::Foreign(_) => call_native(ctx, method, arg_base, ret),
        _ => call_interp(ctx, rt.interp_info(method)?, arg_base, ret, next),
    }
}

/// Virtual and interface calls: resolve against the receiver's runtime class,
/// then re-check whether the override is interpreted or native.
pub(crate) fn call_virtual(
    ctx: &mut ExecContext,
    method: MethodHandle,
    arg_base: Slot,
    ret: Option<Slot>,
    next: usize,
) -> Result<StepResult, Fault> {
    let this = ctx.get(arg_base)?;
    if this.0 == 0 {
        return Err(ctx.exception(ExceptionKind::NullReference));
    }
    let Some(obj) = ObjectRef::from_word(this.0) else {
        // a managed pointer to a value type; the call is already exact
        return call_method(ctx, method, arg_base, ret, next);
    };
    let rt = ctx.runtime_arc();
    let target = rt.resolve_virtual(rt.object_class(obj)?, method)?;
    if target != method {
        vm_trace!(ctx, "virtual {} -> {}", rt.method_name(method), rt.method_name(target));
    }
    // value type overrides see the box contents, not the box
    if rt.class(rt.method(target)?.class)?.is_value_type() {
        let addr = Address::Heap { object: obj, offset: 0 };
        ctx.set(arg_base, StackObject::from_address(Some(addr)))?;
    }
    call_method(ctx, target, arg_base, ret, next)
}

/// `calli` through a method pointer produced by `ldftn`/`ldvirtftn`.
pub(crate) fn call_indirect(
    ctx: &mut ExecContext,
    fnptr: Slot,
    arg_base: Slot,
    ret: Option<Slot>,
    next: usize,
) -> Result<StepResult, Fault> {
    match method_from_pointer(ctx.get(fnptr)?) {
        Some(method) => call_method(ctx, method, arg_base, ret, next),
        None => Err(ctx.exception(ExceptionKind::NullReference)),
    }
}

/// Delegate `Invoke`. The delegate sits at `arg_base`, the invoke arguments
/// follow it.
pub(crate) fn call_delegate(
    ctx: &mut ExecContext,
    arg_base: Slot,
    ret: Option<Slot>,
    next: usize,
) -> Result<StepResult, Fault> {
    let delegate = ctx.object(arg_base)?;
    let rt = ctx.runtime_arc();
    let data = {
        let heap = rt.heap();
        heap.get(delegate)?
            .delegate()
            .cloned()
            .ok_or_else(|| TypeResolutionError::NotADelegate(format!("{delegate:?}")))?
    };
    if data.invocation_list.is_empty() {
        return invoke_single(ctx, data.target, data.method, arg_base, ret, next);
    }

    // multicast: each target runs to completion in turn, the last result wins
    let abs_args = ctx.abs(arg_base)? + 1;
    for entry in data.invocation_list {
        let d = {
            let heap = rt.heap();
            heap.get(entry)?
                .delegate()
                .cloned()
                .ok_or_else(|| TypeResolutionError::NotADelegate(format!("{entry:?}")))?
        };
        let desc = rt.method(d.method)?;
        let descs = abi::describe_args(&rt, TargetAbi::host(), desc)?;
        let bound = desc.has_this() || d.target.is_some();
        let param_slots: usize = descs
            .iter()
            .skip(desc.has_this() as usize)
            .map(|a| a.slots as usize)
            .sum();
        let mut args = Vec::with_capacity(param_slots + 1);
        if bound {
            if d.target.is_none() {
                return Err(ctx.exception(ExceptionKind::NullReference));
            }
            args.push(StackObject::from_ref(d.target));
        }
        args.extend(ctx.interp.machine.slots(abs_args, param_slots)?);

        let slots = ret_desc(&rt, desc.ret)?.map_or(0, |r| r.slots as usize);
        let mut buf = vec![StackObject::default(); slots.max(1)];
        invoke_frame_layout(ctx.interp, d.method, &args, &mut buf)?;
        if let Some(r) = ret {
            let at = ctx.abs(r)?;
            ctx.interp.machine.write_slots(at, &buf[..slots])?;
        }
    }
    Ok(StepResult::Continue)
}

fn invoke_single(
    ctx: &mut ExecContext,
    target: Option<ObjectRef>,
    method: MethodHandle,
    arg_base: Slot,
    ret: Option<Slot>,
    next: usize,
) -> Result<StepResult, Fault> {
    let rt = ctx.runtime_arc();
    let desc = rt.method(method)?;
    if desc.has_this() || target.is_some() {
        if target.is_none() {
            return Err(ctx.exception(ExceptionKind::NullReference));
        }
        // the target replaces the delegate as argument 0
        ctx.set(arg_base, StackObject::from_ref(target))?;
        call_method(ctx, method, arg_base, ret, next)
    } else {
        call_method(ctx, method, arg_base.offset(1), ret, next)
    }
}

/// Runs `method` to completion with frame-layout `args` in a nested
/// invocation.
pub(crate) fn invoke_frame_layout(
    interp: &mut Interpreter,
    method: MethodHandle,
    args: &[StackObject],
    ret: &mut [StackObject],
) -> Result<(), Fault> {
    let rt = interp.runtime().clone();
    let desc = rt.method(method)?;
    if desc.flags.is_static {
        ensure_initialized(interp, desc.class)?;
    }
    match desc.body {
        MethodBody::Native(_) | MethodBody::Foreign(_) => {
            // stage the arguments on the stack so by-reference structs have an address
            let base = interp.machine.alloc_stack_slots(args.len())?;
            let result = match interp.machine.write_slots(base, args) {
                Ok(()) => call_native_at(interp, method, base, ret),
                Err(e) => Err(e.into()),
            };
            interp.machine.set_top(base);
            result
        }
        _ => {
            let info = rt.interp_info(method)?;
            interp
                .run_interpreted(info, args, ret)
                .map_err(|e: ExecuteError| e.into())
        }
    }
}
