//! Calls into C functions through libffi.
use crate::{
    runtime::Runtime,
    types::{
        layout::{FloatKind, ScalarClass, ValueShape},
        ForeignEntry, MethodBody, MethodHandle, TypeDesc,
    },
    utils::SLOT_SIZE,
    value::{StackObject, SlotValue},
    vm::{
        abi::{self, LocationKind, TargetAbi},
        error::{Fault, NativeError, VmError},
        memory::Memory,
        method_info::ArgDesc,
        Interpreter,
    },
};
use libffi::middle::{Cif, CodePtr, Type};
use libloading::{Library, Symbol};
use parking_lot::Mutex;
use std::{collections::HashMap, ffi::c_void, sync::Arc};

/// Shared libraries opened for foreign methods. Libraries stay loaded for the
/// life of the runtime, so resolved entry points never dangle.
#[derive(Default)]
pub struct NativeLibraries {
    libraries: Mutex<HashMap<String, Arc<Library>>>,
}

impl NativeLibraries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_library(&self, name: &str) -> Result<Arc<Library>, NativeError> {
        let mut libraries = self.libraries.lock();
        if let Some(l) = libraries.get(name) {
            return Ok(l.clone());
        }
        // try the name as given, then the platform file name (`libfoo.so`, `foo.dll`)
        let lib = unsafe { Library::new(name) }
            .or_else(|_| unsafe { Library::new(libloading::library_filename(name)) })
            .map_err(|e| NativeError::LibraryLoad {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(library = name, "loaded native library");
        let lib = Arc::new(lib);
        libraries.insert(name.to_string(), lib.clone());
        Ok(lib)
    }

    pub fn get_function(&self, library: &str, name: &str) -> Result<CodePtr, NativeError> {
        let l = self.get_library(library)?;
        let sym: Symbol<unsafe extern "C" fn()> =
            unsafe { l.get(name.as_bytes()) }.map_err(|_| NativeError::SymbolNotFound {
                library: library.to_string(),
                symbol: name.to_string(),
            })?;
        Ok(CodePtr::from_fun(*sym))
    }
}

/// Entry point of a foreign method, resolved once and cached on its descriptor.
fn entry_point(rt: &Runtime, method: MethodHandle) -> Result<CodePtr, VmError> {
    let desc = rt.method(method)?;
    if let Some(&addr) = desc.foreign.get() {
        return Ok(CodePtr::from_ptr(addr as *const c_void));
    }
    let code = match &desc.body {
        MethodBody::Foreign(ForeignEntry::Address(addr)) => CodePtr::from_ptr(*addr as *const c_void),
        MethodBody::Foreign(ForeignEntry::Symbol { library, symbol }) => {
            rt.libraries().get_function(library, symbol)?
        }
        _ => return Err(NativeError::Unsupported(rt.method_name(method)).into()),
    };
    let addr = *desc.foreign.get_or_init(|| code.as_ptr() as usize);
    Ok(CodePtr::from_ptr(addr as *const c_void))
}

fn scalar_type(class: ScalarClass) -> Type {
    match class {
        ScalarClass::Int { size: 1, signed: true } => Type::i8(),
        ScalarClass::Int { size: 1, signed: false } => Type::u8(),
        ScalarClass::Int { size: 2, signed: true } => Type::i16(),
        ScalarClass::Int { size: 2, signed: false } => Type::u16(),
        ScalarClass::Int { size: 4, signed: true } => Type::i32(),
        ScalarClass::Int { size: 4, signed: false } => Type::u32(),
        ScalarClass::Int { signed: true, .. } => Type::i64(),
        ScalarClass::Int { signed: false, .. } => Type::u64(),
        ScalarClass::Float(FloatKind::F32) => Type::f32(),
        ScalarClass::Float(FloatKind::F64) => Type::f64(),
        ScalarClass::Pointer => Type::pointer(),
    }
}

/// libffi description of a parameter or return type. Value types become
/// structures of their flattened leaves, which libffi then passes by the
/// platform's own rules.
fn ffi_type(rt: &Runtime, ty: TypeDesc) -> Result<Type, VmError> {
    match ty {
        TypeDesc::Void => return Ok(Type::void()),
        TypeDesc::Object(_) => return Err(NativeError::Unsupported(rt.type_name(ty)).into()),
        _ => {}
    }
    Ok(match rt.value_layout(ty)?.shape {
        ValueShape::Scalar(class) => scalar_type(class),
        ValueShape::Aggregate(leaves) => Type::structure(leaves.iter().map(|l| scalar_type(l.class))),
    })
}

/// Bytes of one host-layout argument, starting at `args[0]`.
fn arg_bytes(mem: &mut Memory, desc: &ArgDesc, args: &[StackObject]) -> Result<Vec<u8>, VmError> {
    let size = desc.kind.value_size() as usize;
    let mut out = vec![0u8; size.max(SLOT_SIZE)];
    match desc.kind {
        LocationKind::Indirect(_) => {
            let addr = args[0]
                .as_address()?
                .ok_or(NativeError::Unsupported("null by-reference struct".into()))?;
            mem.read_bytes(addr, &mut out[..size])?;
        }
        _ => {
            for (i, slot) in args.iter().take(desc.host_slots()).enumerate() {
                let end = ((i + 1) * SLOT_SIZE).min(out.len());
                slot.0.write_to(&mut out[i * SLOT_SIZE..end]);
            }
        }
    }
    Ok(out)
}

/// Calls a foreign method with host-layout `args`, writing its result to `ret`.
pub(crate) fn call_foreign(
    interp: &mut Interpreter,
    method: MethodHandle,
    args: &[StackObject],
    ret: &mut [StackObject],
) -> Result<(), Fault> {
    let rt = interp.runtime().clone();
    let code = entry_point(&rt, method)?;
    let desc = rt.method(method)?;
    let abi = TargetAbi::host();
    let descs = abi::describe_args(&rt, abi, desc)?;

    let mut types = Vec::with_capacity(descs.len());
    let mut buffers = Vec::with_capacity(descs.len());
    let mut mem = Memory::new(&rt, &mut interp.machine);
    let mut cursor = 0;
    for d in &descs {
        types.push(ffi_type(&rt, d.ty)?);
        let end = cursor + d.host_slots();
        let slots = args
            .get(cursor..end)
            .ok_or_else(|| NativeError::Unsupported(format!("{} arguments", rt.method_name(method))))?;
        buffers.push(arg_bytes(&mut mem, d, slots)?);
        cursor = end;
    }
    let cif = Cif::new(types, ffi_type(&rt, desc.ret)?);

    let ret_size = rt.type_size(desc.ret)? as usize;
    let mut rvalue = vec![0u64; crate::utils::slots_for_bytes(ret_size).max(1)];
    let mut arg_ptrs: Vec<*mut c_void> = buffers
        .iter_mut()
        .map(|b| b.as_mut_ptr() as *mut c_void)
        .collect();
    tracing::trace!(method = %rt.method_name(method), args = descs.len(), "foreign call");
    rt.metrics().record_foreign_call();
    // SAFETY: the cif was built from the callee's signature and every argument
    // buffer holds at least as many bytes as its libffi type.
    unsafe {
        libffi::raw::ffi_call(
            cif.as_raw_ptr(),
            Some(*code.as_fun()),
            rvalue.as_mut_ptr() as *mut c_void,
            arg_ptrs.as_mut_ptr(),
        );
    }
    for (dst, word) in ret.iter_mut().zip(&rvalue) {
        *dst = StackObject(*word);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_an_error() {
        let libs = NativeLibraries::new();
        assert!(matches!(
            libs.get_library("definitely-not-a-real-library-name"),
            Err(NativeError::LibraryLoad { .. })
        ));
    }

    #[test]
    fn value_types_become_structures() {
        let mut rt = Runtime::default();
        let pair = rt
            .define_class(
                crate::types::ClassDef::value_type("Pair")
                    .field("a", TypeDesc::I4)
                    .field("b", TypeDesc::R8),
            )
            .unwrap();
        let rt = rt.seal();
        assert!(ffi_type(&rt, TypeDesc::Value(pair)).is_ok());
        assert!(ffi_type(&rt, TypeDesc::Object(rt.string_class())).is_err());
    }
}
