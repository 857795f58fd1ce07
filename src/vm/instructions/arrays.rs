use crate::{
    runtime::exceptions::ExceptionKind,
    types::{ClassHandle, TypeDesc},
    value::{Address, ObjectRef, StackObject},
    vm::{
        context::ExecContext,
        error::{Fault, TypeResolutionError},
        instructions::{
            fields::{load, load_n, store, store_n, store_ref},
            misrouted,
        },
        opcodes::{Instruction as I, Slot},
        StepResult,
    },
};

/// Location of element `index` of the vector in `arr`, bounds-checked.
fn element(ctx: &mut ExecContext, arr: Slot, index: Slot) -> Result<Address, Fault> {
    let object = ctx.object(arr)?;
    let (len, element_size) = {
        let heap = ctx.runtime().heap();
        let shape = heap
            .get(object)?
            .array_shape()
            .ok_or_else(|| TypeResolutionError::NotAnArray(format!("{object:?}")))?;
        (shape.total_len(), shape.element_size)
    };
    let i: i32 = ctx.slot(index)?;
    if i < 0 || i as usize >= len {
        return Err(ctx.exception(ExceptionKind::IndexOutOfRange));
    }
    Ok(Address::Heap {
        object,
        offset: i as u32 * element_size,
    })
}

/// Location of a multi-dimensional element; the indices sit in the slots named
/// by resolve entry `indices`.
fn md_element(ctx: &mut ExecContext, arr: Slot, indices: u32) -> Result<(Address, TypeDesc), Fault> {
    let object = ctx.object(arr)?;
    let method = ctx.method.clone();
    let position = method
        .slot_list(indices)?
        .iter()
        .map(|&s| ctx.slot::<i32>(s))
        .collect::<Result<Vec<_>, _>>()?;
    let rt = ctx.runtime_arc();
    let (flat, element_size, class) = {
        let heap = rt.heap();
        let obj = heap.get(object)?;
        let shape = obj
            .array_shape()
            .ok_or_else(|| TypeResolutionError::NotAnArray(format!("{object:?}")))?;
        (shape.flat_index(&position), shape.element_size, obj.class)
    };
    let Some(flat) = flat else {
        return Err(ctx.exception(ExceptionKind::IndexOutOfRange));
    };
    let element_type = element_type(ctx, class)?;
    let addr = Address::Heap {
        object,
        offset: flat as u32 * element_size,
    };
    Ok((addr, element_type))
}

fn element_type(ctx: &ExecContext, array_class: ClassHandle) -> Result<TypeDesc, Fault> {
    let info = ctx.runtime().class(array_class)?;
    Ok(info
        .element_type()
        .ok_or_else(|| TypeResolutionError::NotAnArray(info.name.clone()))?)
}

/// Reference stores into arrays must match the element type; arrays are
/// covariant so the static type alone proves nothing.
fn check_store(ctx: &ExecContext, array: ObjectRef, value: Option<ObjectRef>) -> Result<(), Fault> {
    let Some(value) = value else {
        return Ok(());
    };
    let rt = ctx.runtime();
    if let TypeDesc::Object(expected) = element_type(ctx, rt.object_class(array)?)? {
        if !rt.is_assignable(rt.object_class(value)?, expected) {
            return Err(ctx.exception(ExceptionKind::ArrayTypeMismatch));
        }
    }
    Ok(())
}

fn length(ctx: &mut ExecContext, s: Slot) -> Result<u32, Fault> {
    let n: i32 = ctx.slot(s)?;
    u32::try_from(n).map_err(|_| ctx.exception(ExceptionKind::Overflow))
}

fn load_typed(ctx: &mut ExecContext, dst: Slot, at: Address, ty: TypeDesc) -> Result<(), Fault> {
    match ty {
        TypeDesc::I1 => load::<i8, i32>(ctx, dst, at, |v| v as i32),
        TypeDesc::U1 | TypeDesc::Bool => load::<u8, i32>(ctx, dst, at, |v| v as i32),
        TypeDesc::I2 => load::<i16, i32>(ctx, dst, at, |v| v as i32),
        TypeDesc::U2 | TypeDesc::Char => load::<u16, i32>(ctx, dst, at, |v| v as i32),
        TypeDesc::I4 | TypeDesc::U4 | TypeDesc::R4 => load::<u32, u32>(ctx, dst, at, |v| v),
        TypeDesc::Value(_) => {
            let size = ctx.runtime().type_size(ty)?;
            load_n(ctx, dst, at, size as u16)
        }
        _ => load::<u64, u64>(ctx, dst, at, |v| v),
    }
}

fn store_typed(ctx: &mut ExecContext, at: Address, src: Slot, ty: TypeDesc) -> Result<(), Fault> {
    match ty {
        TypeDesc::I1 | TypeDesc::U1 | TypeDesc::Bool => store::<u8>(ctx, at, src),
        TypeDesc::I2 | TypeDesc::U2 | TypeDesc::Char => store::<u16>(ctx, at, src),
        TypeDesc::I4 | TypeDesc::U4 | TypeDesc::R4 => store::<u32>(ctx, at, src),
        TypeDesc::Object(_) => store_ref(ctx, at, src),
        TypeDesc::Value(_) => {
            let size = ctx.runtime().type_size(ty)?;
            store_n(ctx, at, src, size as u16)
        }
        _ => store::<u64>(ctx, at, src),
    }
}

pub fn execute(ctx: &mut ExecContext, instr: I) -> Result<StepResult, Fault> {
    match instr {
        I::Newarr { dst, class, len } => {
            let n = length(ctx, len)?;
            let arr = ctx.runtime().new_array(class, n)?;
            ctx.set(dst, StackObject::from_ref(Some(arr)))?;
        }
        I::Ldlen { dst, arr } => {
            let object = ctx.object(arr)?;
            let len = {
                let heap = ctx.runtime().heap();
                let obj = heap.get(object)?;
                obj.array_shape()
                    .ok_or_else(|| TypeResolutionError::NotAnArray(format!("{object:?}")))?
                    .total_len()
            };
            ctx.set_slot(dst, len as u64)?;
        }

        I::LdelemI1 { dst, arr, index } => {
            let at = element(ctx, arr, index)?;
            load::<i8, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdelemU1 { dst, arr, index } => {
            let at = element(ctx, arr, index)?;
            load::<u8, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdelemI2 { dst, arr, index } => {
            let at = element(ctx, arr, index)?;
            load::<i16, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdelemU2 { dst, arr, index } => {
            let at = element(ctx, arr, index)?;
            load::<u16, i32>(ctx, dst, at, |v| v as i32)?
        }
        I::LdelemI4 { dst, arr, index } => {
            let at = element(ctx, arr, index)?;
            load::<i32, i32>(ctx, dst, at, |v| v)?
        }
        I::LdelemI8 { dst, arr, index } => {
            let at = element(ctx, arr, index)?;
            load::<u64, u64>(ctx, dst, at, |v| v)?
        }
        I::LdelemN { dst, arr, index, size } => {
            let at = element(ctx, arr, index)?;
            load_n(ctx, dst, at, size)?
        }

        I::StelemI1 { arr, index, src } => {
            let at = element(ctx, arr, index)?;
            store::<i8>(ctx, at, src)?
        }
        I::StelemI2 { arr, index, src } => {
            let at = element(ctx, arr, index)?;
            store::<i16>(ctx, at, src)?
        }
        I::StelemI4 { arr, index, src } => {
            let at = element(ctx, arr, index)?;
            store::<i32>(ctx, at, src)?
        }
        I::StelemI8 { arr, index, src } => {
            let at = element(ctx, arr, index)?;
            store::<u64>(ctx, at, src)?
        }
        I::StelemRef { arr, index, src } => {
            let at = element(ctx, arr, index)?;
            let array = ctx.object(arr)?;
            check_store(ctx, array, ctx.slot(src)?)?;
            store_ref(ctx, at, src)?
        }
        I::StelemN { arr, index, src, size } => {
            let at = element(ctx, arr, index)?;
            store_n(ctx, at, src, size)?
        }

        I::Ldelema { dst, arr, index, class } => {
            let at = element(ctx, arr, index)?;
            let array = ctx.object(arr)?;
            let actual = element_type(ctx, ctx.runtime().object_class(array)?)?;
            // a writable element address demands the exact element type
            if let TypeDesc::Object(c) = actual {
                if c != class {
                    return Err(ctx.exception(ExceptionKind::ArrayTypeMismatch));
                }
            }
            ctx.set(dst, StackObject::from_address(Some(at)))?;
        }
        I::LdelemaReadonly { dst, arr, index } => {
            let at = element(ctx, arr, index)?;
            ctx.set(dst, StackObject::from_address(Some(at)))?;
        }

        I::NewMdArr { dst, class, lengths } => {
            let method = ctx.method.clone();
            let lens = method
                .slot_list(lengths)?
                .iter()
                .map(|&s| length(ctx, s))
                .collect::<Result<Vec<_>, _>>()?;
            let arr = ctx.runtime().new_md_array(class, &lens, &[])?;
            ctx.set(dst, StackObject::from_ref(Some(arr)))?;
        }
        I::NewMdArrBounded { dst, class, lengths, bounds } => {
            let method = ctx.method.clone();
            let lens = method
                .slot_list(lengths)?
                .iter()
                .map(|&s| length(ctx, s))
                .collect::<Result<Vec<_>, _>>()?;
            let lower = method
                .slot_list(bounds)?
                .iter()
                .map(|&s| ctx.slot::<i32>(s))
                .collect::<Result<Vec<_>, _>>()?;
            let arr = ctx.runtime().new_md_array(class, &lens, &lower)?;
            ctx.set(dst, StackObject::from_ref(Some(arr)))?;
        }
        I::GetMdElem { dst, arr, indices } => {
            let (at, ty) = md_element(ctx, arr, indices)?;
            load_typed(ctx, dst, at, ty)?;
        }
        I::SetMdElem { arr, indices, src } => {
            let (at, ty) = md_element(ctx, arr, indices)?;
            if ty.is_reference() {
                let array = ctx.object(arr)?;
                check_store(ctx, array, ctx.slot(src)?)?;
            }
            store_typed(ctx, at, src, ty)?;
        }
        I::GetMdElemAddr { dst, arr, indices } => {
            let (at, _) = md_element(ctx, arr, indices)?;
            ctx.set(dst, StackObject::from_address(Some(at)))?;
        }
        _ => return Err(misrouted(ctx, instr)),
    }
    Ok(StepResult::Continue)
}
