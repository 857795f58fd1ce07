//! Reference host object model.
//!
//! The engine never defines object layout, class hierarchy or allocation on
//! its own; it asks the [`Runtime`] for them. A runtime is assembled mutably
//! (classes, methods, bodies) and then [sealed](Runtime::seal) into a shared,
//! immutable `Arc<Runtime>` that any number of threads can interpret against.
use crate::{
    config::InterpreterConfig,
    types::{
        layout::{place_fields, FloatKind, LeafField, ScalarClass, ValueLayout, ValueShape},
        ClassDef, ClassHandle, ClassInfo, ClassKind, FieldInfo, FieldStorage, InterpSource,
        MethodBody, MethodDef, MethodDesc, MethodHandle, TypeDesc,
    },
    value::{
        object::{ArrayShape, DelegateData, ExceptionDetails, HeapObject, ObjectKind},
        storage::{Heap, NoBarrier, WriteBarrier},
        ObjectRef, SlotValue, StackObject,
    },
    vm::{
        error::{ExecutionError, MemoryError, TypeResolutionError, VmError},
        method_info::InterpMethodInfo,
        metrics::RuntimeMetrics,
        pinvoke::NativeLibraries,
        tracer::Tracer,
    },
};
use exceptions::ExceptionKind;
use init::ClassInitCell;
use parking_lot::{Mutex, MutexGuard};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, OnceLock,
    },
};

pub mod exceptions;
pub mod init;

static NEXT_RUNTIME_ID: AtomicU32 = AtomicU32::new(1);

/// Classes every runtime starts with.
pub(crate) struct WellKnown {
    pub object: ClassHandle,
    pub value_type: ClassHandle,
    pub string: ClassHandle,
    pub array: ClassHandle,
    pub delegate: ClassHandle,
    pub exception: ClassHandle,
    pub exception_kinds: Vec<ClassHandle>,
}

pub struct Runtime {
    id: u32,
    classes: Vec<ClassInfo>,
    methods: Vec<MethodDesc>,
    array_classes: HashMap<(TypeDesc, u8), ClassHandle>,
    pub(crate) well_known: WellKnown,
    pub(crate) heap: Mutex<Heap>,
    barrier: Box<dyn WriteBarrier>,
    config: InterpreterConfig,
    tracer: Mutex<Tracer>,
    tracer_enabled: AtomicBool,
    metrics: RuntimeMetrics,
    libraries: NativeLibraries,
    sealed: bool,
}

impl Runtime {
    /// A runtime configured from the environment.
    pub fn new() -> Self {
        Self::with_config(InterpreterConfig::from_env())
    }

    pub fn with_config(config: InterpreterConfig) -> Self {
        let tracer = Tracer::new(&config.trace);
        let enabled = tracer.is_enabled();
        let placeholder = ClassHandle(0);
        let mut rt = Self {
            id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
            classes: vec![],
            methods: vec![],
            array_classes: HashMap::new(),
            well_known: WellKnown {
                object: placeholder,
                value_type: placeholder,
                string: placeholder,
                array: placeholder,
                delegate: placeholder,
                exception: placeholder,
                exception_kinds: vec![],
            },
            heap: Mutex::new(Heap::default()),
            barrier: Box::new(NoBarrier),
            config,
            tracer: Mutex::new(tracer),
            tracer_enabled: AtomicBool::new(enabled),
            metrics: RuntimeMetrics::new(),
            libraries: NativeLibraries::new(),
            sealed: false,
        };
        rt.define_core_classes();
        rt
    }

    fn define_core_classes(&mut self) {
        let object = self.push_class(ClassDef::class("System.Object"), None);
        self.well_known.object = object;
        self.well_known.value_type =
            self.push_class(ClassDef::class("System.ValueType"), Some(object));
        self.well_known.string = self.push_class(
            ClassDef {
                kind: ClassKind::String,
                ..ClassDef::class("System.String")
            },
            Some(object),
        );
        self.well_known.array = self.push_class(ClassDef::class("System.Array"), Some(object));
        self.well_known.delegate =
            self.push_class(ClassDef::class("System.Delegate"), Some(object));
        let exception = self.push_class(ClassDef::class("System.Exception"), Some(object));
        self.well_known.exception = exception;

        let mut kinds: HashMap<ExceptionKind, ClassHandle> = HashMap::new();
        for kind in ExceptionKind::ALL {
            self.exception_kind_class(kind, &mut kinds);
        }
        self.well_known.exception_kinds = ExceptionKind::ALL.iter().map(|k| kinds[k]).collect();
    }

    fn exception_kind_class(
        &mut self,
        kind: ExceptionKind,
        done: &mut HashMap<ExceptionKind, ClassHandle>,
    ) -> ClassHandle {
        if let Some(&c) = done.get(&kind) {
            return c;
        }
        let parent = match kind.parent() {
            Some(p) => self.exception_kind_class(p, done),
            None => self.well_known.exception,
        };
        let c = self.push_class(ClassDef::class(kind.class_name()), Some(parent));
        done.insert(kind, c);
        c
    }

    /// Infallible insert used for built-in classes, which have no fields.
    fn push_class(&mut self, def: ClassDef, parent: Option<ClassHandle>) -> ClassHandle {
        let handle = ClassHandle(self.classes.len() as u32);
        let parent_size = parent
            .and_then(|p| self.classes.get(p.0 as usize))
            .map_or(0, |p| p.instance_size);
        self.classes.push(ClassInfo {
            name: def.name,
            parent,
            kind: def.kind,
            interfaces: def.interfaces,
            fields: vec![],
            instance_size: parent_size,
            instance_align: 8,
            contains_refs: false,
            static_size: 0,
            thread_static_size: 0,
            cctor: None,
            methods: vec![],
            vtable: vec![],
            interface_slots: vec![],
            init: ClassInitCell::default(),
        });
        self.heap.get_mut().add_static_block(0);
        handle
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub fn libraries(&self) -> &NativeLibraries {
        &self.libraries
    }

    pub fn tracer_enabled(&self) -> bool {
        self.tracer_enabled.load(Ordering::Relaxed)
    }

    pub fn tracer(&self) -> MutexGuard<'_, Tracer> {
        self.tracer.lock()
    }

    pub fn write_barrier(&self) -> &dyn WriteBarrier {
        &*self.barrier
    }

    pub fn set_write_barrier(&mut self, barrier: impl WriteBarrier + 'static) {
        self.barrier = Box::new(barrier);
    }

    pub fn heap(&self) -> MutexGuard<'_, Heap> {
        self.heap.lock()
    }

    // ---- definition phase -------------------------------------------------

    pub fn define_class(&mut self, def: ClassDef) -> Result<ClassHandle, VmError> {
        let handle = ClassHandle(self.classes.len() as u32);
        let parent = match (def.parent, def.kind) {
            (Some(p), _) => {
                self.class(p)?;
                Some(p)
            }
            (None, ClassKind::Interface) => None,
            (None, ClassKind::ValueType | ClassKind::Nullable(_)) => Some(self.well_known.value_type),
            (None, ClassKind::Delegate) => Some(self.well_known.delegate),
            (None, ClassKind::Array { .. }) => Some(self.well_known.array),
            (None, _) => Some(self.well_known.object),
        };
        for &i in &def.interfaces {
            if !self.class(i)?.is_interface() {
                return Err(TypeResolutionError::InvalidClass(i.0).into());
            }
        }
        let is_value = matches!(def.kind, ClassKind::ValueType | ClassKind::Nullable(_));
        let (instance_start, mut contains_refs) = match parent {
            Some(p) if !is_value => {
                let p = self.class(p)?;
                (p.instance_size, p.contains_refs)
            }
            _ => (0, false),
        };

        let mut groups: [Vec<(usize, (u32, u32))>; 3] = Default::default();
        for (i, (_, ty, storage)) in def.fields.iter().enumerate() {
            let layout = self.value_layout(*ty)?;
            if storage == &FieldStorage::Instance {
                contains_refs |= self.type_contains_refs(*ty);
            }
            let group = match storage {
                FieldStorage::Instance => 0,
                FieldStorage::Static => 1,
                FieldStorage::ThreadStatic => 2,
            };
            groups[group].push((i, (layout.size, layout.align)));
        }
        let mut offsets = vec![0u32; def.fields.len()];
        let mut ends = [0u32; 3];
        let mut aligns = [1u32; 3];
        for (g, group) in groups.iter().enumerate() {
            let start = if g == 0 { instance_start } else { 0 };
            let sizes: Vec<_> = group.iter().map(|(_, l)| *l).collect();
            let (placed, end, align) = place_fields(start, &sizes);
            for ((field, _), off) in group.iter().zip(placed) {
                offsets[*field] = off;
            }
            ends[g] = end;
            aligns[g] = align;
        }
        let instance_align = if is_value { aligns[0] } else { 8 };
        let instance_size = if is_value {
            // empty structs still occupy one byte
            crate::utils::align_up(ends[0].max(1) as usize, aligns[0] as usize) as u32
        } else {
            ends[0].max(instance_start)
        };

        let fields = def
            .fields
            .into_iter()
            .zip(offsets)
            .map(|((name, ty, storage), offset)| FieldInfo {
                name,
                ty,
                storage,
                offset,
            })
            .collect();

        self.classes.push(ClassInfo {
            name: def.name,
            parent,
            kind: def.kind,
            interfaces: def.interfaces,
            fields,
            instance_size,
            instance_align,
            contains_refs,
            static_size: ends[1],
            thread_static_size: ends[2],
            cctor: None,
            methods: vec![],
            vtable: vec![],
            interface_slots: vec![],
            init: ClassInitCell::default(),
        });
        self.heap.get_mut().add_static_block(ends[1]);
        tracing::trace!(class = ?handle, size = instance_size, "class defined");
        Ok(handle)
    }

    /// Array class for `element` and `rank`, created on first request.
    pub fn define_array(&mut self, element: TypeDesc, rank: u8) -> Result<ClassHandle, VmError> {
        if let Some(&c) = self.array_classes.get(&(element, rank)) {
            return Ok(c);
        }
        let dims = if rank <= 1 {
            "[]".to_string()
        } else {
            format!("[{}]", ",".repeat(rank as usize - 1))
        };
        let name = format!("{}{}", self.type_name(element), dims);
        let c = self.define_class(ClassDef {
            kind: ClassKind::Array {
                element,
                rank: rank.max(1),
            },
            ..ClassDef::class(name)
        })?;
        self.array_classes.insert((element, rank), c);
        Ok(c)
    }

    /// `Nullable<T>` over an existing value type.
    pub fn define_nullable(&mut self, underlying: ClassHandle) -> Result<ClassHandle, VmError> {
        let name = format!("System.Nullable<{}>", self.class(underlying)?.name);
        self.define_class(ClassDef {
            kind: ClassKind::Nullable(underlying),
            ..ClassDef::value_type(name)
                .field("hasValue", TypeDesc::Bool)
                .field("value", TypeDesc::Value(underlying))
        })
    }

    pub fn define_method(&mut self, def: MethodDef) -> Result<MethodHandle, VmError> {
        let class = self.class(def.class)?;
        let this_type = if class.is_value_type() {
            TypeDesc::Ptr
        } else {
            TypeDesc::Object(def.class)
        };
        let mut flags = def.flags;
        if class.is_interface() {
            flags.is_virtual = true;
            flags.is_static = false;
        }
        let handle = MethodHandle(self.methods.len() as u32);
        self.methods.push(MethodDesc {
            name: def.name,
            class: def.class,
            params: def.params,
            ret: def.ret,
            flags,
            slot: None,
            body: def.body,
            interp: OnceLock::new(),
            foreign: OnceLock::new(),
            this_type,
        });
        self.classes[def.class.0 as usize].methods.push(handle);
        Ok(handle)
    }

    pub fn set_body(&mut self, method: MethodHandle, body: MethodBody) -> Result<(), VmError> {
        let m = self
            .methods
            .get_mut(method.0 as usize)
            .ok_or(TypeResolutionError::InvalidMethod(method.0))?;
        m.body = body;
        m.interp = OnceLock::new();
        Ok(())
    }

    /// Installs a prebuilt interpreted body.
    pub fn set_interp_body(&mut self, method: MethodHandle, info: InterpMethodInfo) -> Result<(), VmError> {
        self.set_body(method, MethodBody::Interpreted(InterpSource::Ready(Arc::new(info))))
    }

    pub fn set_cctor(&mut self, class: ClassHandle, cctor: MethodHandle) -> Result<(), VmError> {
        self.method(cctor)?;
        let info = self
            .classes
            .get_mut(class.0 as usize)
            .ok_or(TypeResolutionError::InvalidClass(class.0))?;
        info.cctor = Some(cctor);
        Ok(())
    }

    /// Computes vtables and interface maps and freezes the type system.
    pub fn seal(mut self) -> Arc<Runtime> {
        for c in 0..self.classes.len() {
            self.build_dispatch_tables(c);
        }
        self.sealed = true;
        tracing::debug!(
            classes = self.classes.len(),
            methods = self.methods.len(),
            "runtime sealed"
        );
        Arc::new(self)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn same_signature(&self, a: MethodHandle, b: MethodHandle) -> bool {
        let (a, b) = (&self.methods[a.0 as usize], &self.methods[b.0 as usize]);
        a.name == b.name && a.params == b.params
    }

    fn build_dispatch_tables(&mut self, c: usize) {
        let own_methods = self.classes[c].methods.clone();
        if self.classes[c].is_interface() {
            for (slot, m) in own_methods.iter().enumerate() {
                self.methods[m.0 as usize].slot = Some(slot as u16);
            }
            return;
        }

        let mut vtable = self.classes[c]
            .parent
            .map(|p| self.classes[p.0 as usize].vtable.clone())
            .unwrap_or_default();
        for &m in &own_methods {
            let flags = self.methods[m.0 as usize].flags;
            if !flags.is_virtual {
                continue;
            }
            let inherited = if flags.new_slot {
                None
            } else {
                vtable.iter().position(|&v| self.same_signature(v, m))
            };
            let slot = match inherited {
                Some(s) => {
                    vtable[s] = m;
                    s
                }
                None => {
                    vtable.push(m);
                    vtable.len() - 1
                }
            };
            self.methods[m.0 as usize].slot = Some(slot as u16);
        }

        let mut interfaces = vec![];
        let mut seen = HashSet::new();
        self.collect_interfaces(ClassHandle(c as u32), &mut interfaces, &mut seen);
        let interface_slots = interfaces
            .into_iter()
            .map(|iface| {
                let slots = self.classes[iface.0 as usize]
                    .methods
                    .iter()
                    .map(|&im| {
                        vtable
                            .iter()
                            .rposition(|&v| self.same_signature(v, im))
                            .map_or(u16::MAX, |s| s as u16)
                    })
                    .collect();
                (iface, slots)
            })
            .collect();

        let class = &mut self.classes[c];
        class.vtable = vtable;
        class.interface_slots = interface_slots;
    }

    fn collect_interfaces(&self, class: ClassHandle, out: &mut Vec<ClassHandle>, seen: &mut HashSet<ClassHandle>) {
        let info = &self.classes[class.0 as usize];
        for &i in &info.interfaces {
            if seen.insert(i) {
                out.push(i);
                self.collect_interfaces(i, out, seen);
            }
        }
        if let Some(p) = info.parent {
            self.collect_interfaces(p, out, seen);
        }
    }

    // ---- queries ----------------------------------------------------------

    pub fn class(&self, handle: ClassHandle) -> Result<&ClassInfo, TypeResolutionError> {
        self.classes
            .get(handle.0 as usize)
            .ok_or(TypeResolutionError::InvalidClass(handle.0))
    }

    pub fn method(&self, handle: MethodHandle) -> Result<&MethodDesc, TypeResolutionError> {
        self.methods
            .get(handle.0 as usize)
            .ok_or(TypeResolutionError::InvalidMethod(handle.0))
    }

    pub fn find_class(&self, name: &str) -> Option<ClassHandle> {
        self.classes
            .iter()
            .position(|c| c.name == name)
            .map(|i| ClassHandle(i as u32))
    }

    pub fn find_method(&self, class: ClassHandle, name: &str) -> Option<MethodHandle> {
        self.classes
            .get(class.0 as usize)?
            .methods
            .iter()
            .copied()
            .find(|&m| self.methods[m.0 as usize].name == name)
    }

    pub fn method_name(&self, handle: MethodHandle) -> String {
        match self.method(handle) {
            Ok(m) => {
                let class = self.class(m.class).map_or("?", |c| c.name.as_str());
                format!("{}::{}", class, m.name)
            }
            Err(_) => format!("{handle:?}"),
        }
    }

    pub fn object_class_handle(&self) -> ClassHandle {
        self.well_known.object
    }

    pub fn string_class(&self) -> ClassHandle {
        self.well_known.string
    }

    pub fn exception_base(&self) -> ClassHandle {
        self.well_known.exception
    }

    pub fn array_class(&self, element: TypeDesc, rank: u8) -> Option<ClassHandle> {
        self.array_classes.get(&(element, rank)).copied()
    }

    pub fn type_name(&self, ty: TypeDesc) -> String {
        use TypeDesc::*;
        match ty {
            Void => "System.Void".into(),
            Bool => "System.Boolean".into(),
            Char => "System.Char".into(),
            I1 => "System.SByte".into(),
            U1 => "System.Byte".into(),
            I2 => "System.Int16".into(),
            U2 => "System.UInt16".into(),
            I4 => "System.Int32".into(),
            U4 => "System.UInt32".into(),
            I8 => "System.Int64".into(),
            U8 => "System.UInt64".into(),
            R4 => "System.Single".into(),
            R8 => "System.Double".into(),
            IntPtr => "System.IntPtr".into(),
            UIntPtr => "System.UIntPtr".into(),
            Ptr => "void*".into(),
            Object(c) | Value(c) => self
                .class(c)
                .map_or_else(|_| format!("{c:?}"), |i| i.name.clone()),
        }
    }

    pub fn value_layout(&self, ty: TypeDesc) -> Result<ValueLayout, TypeResolutionError> {
        use TypeDesc::*;
        let int = |size: u8, signed: bool| ScalarClass::Int { size, signed };
        Ok(match ty {
            Void => ValueLayout {
                size: 0,
                align: 1,
                shape: ValueShape::Aggregate(vec![]),
            },
            Bool | U1 => ValueLayout::scalar(1, int(1, false)),
            I1 => ValueLayout::scalar(1, int(1, true)),
            Char | U2 => ValueLayout::scalar(2, int(2, false)),
            I2 => ValueLayout::scalar(2, int(2, true)),
            I4 => ValueLayout::scalar(4, int(4, true)),
            U4 => ValueLayout::scalar(4, int(4, false)),
            I8 | IntPtr => ValueLayout::scalar(8, int(8, true)),
            U8 | UIntPtr => ValueLayout::scalar(8, int(8, false)),
            R4 => ValueLayout::scalar(4, ScalarClass::Float(FloatKind::F32)),
            R8 => ValueLayout::scalar(8, ScalarClass::Float(FloatKind::F64)),
            Ptr | Object(_) => ValueLayout::scalar(8, ScalarClass::Pointer),
            Value(c) => {
                let info = self.class(c)?;
                let mut leaves = vec![];
                self.flatten_leaves(c, 0, &mut leaves)?;
                ValueLayout {
                    size: info.instance_size,
                    align: info.instance_align,
                    shape: ValueShape::Aggregate(leaves),
                }
            }
        })
    }

    fn flatten_leaves(&self, class: ClassHandle, base: u32, out: &mut Vec<LeafField>) -> Result<(), TypeResolutionError> {
        for field in &self.class(class)?.fields {
            if field.storage != FieldStorage::Instance {
                continue;
            }
            match field.ty {
                TypeDesc::Value(inner) => self.flatten_leaves(inner, base + field.offset, out)?,
                ty => {
                    if let ValueShape::Scalar(class) = self.value_layout(ty)?.shape {
                        out.push(LeafField {
                            offset: base + field.offset,
                            class,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn type_size(&self, ty: TypeDesc) -> Result<u32, TypeResolutionError> {
        match ty.primitive_layout() {
            Some((size, _)) => Ok(size),
            None => self.value_layout(ty).map(|l| l.size),
        }
    }

    /// Evaluation stack slots a value of `ty` occupies.
    pub fn type_slots(&self, ty: TypeDesc) -> Result<usize, TypeResolutionError> {
        Ok(crate::utils::slots_for_bytes(self.type_size(ty)? as usize))
    }

    fn type_contains_refs(&self, ty: TypeDesc) -> bool {
        match ty {
            TypeDesc::Object(_) => true,
            TypeDesc::Value(c) => self.class(c).is_ok_and(|c| c.contains_refs),
            _ => false,
        }
    }

    pub fn is_subclass(&self, class: ClassHandle, ancestor: ClassHandle) -> bool {
        let mut cur = Some(class);
        while let Some(c) = cur {
            if c == ancestor {
                return true;
            }
            cur = self.class(c).ok().and_then(|i| i.parent);
        }
        false
    }

    pub fn implements(&self, class: ClassHandle, interface: ClassHandle) -> bool {
        let mut out = vec![];
        let mut seen = HashSet::new();
        self.collect_interfaces(class, &mut out, &mut seen);
        seen.contains(&interface)
    }

    /// Whether a value of runtime class `from` can be stored where `to` is expected.
    pub fn is_assignable(&self, from: ClassHandle, to: ClassHandle) -> bool {
        if from == to || to == self.well_known.object {
            return true;
        }
        let (Ok(f), Ok(t)) = (self.class(from), self.class(to)) else {
            return false;
        };
        if t.is_interface() {
            return self.implements(from, to);
        }
        if let (
            ClassKind::Array {
                element: fe,
                rank: fr,
            },
            ClassKind::Array {
                element: te,
                rank: tr,
            },
        ) = (f.kind, t.kind)
        {
            return fr == tr
                && match (fe, te) {
                    (TypeDesc::Object(a), TypeDesc::Object(b)) => self.is_assignable(a, b),
                    (a, b) => a == b,
                };
        }
        self.is_subclass(from, to)
    }

    /// Concrete implementation of `method` for an object of class `class`.
    pub fn resolve_virtual(&self, class: ClassHandle, method: MethodHandle) -> Result<MethodHandle, VmError> {
        let m = self.method(method)?;
        if !m.flags.is_virtual {
            return Ok(method);
        }
        let info = self.class(class)?;
        let missing = |slot| TypeResolutionError::MissingSlot {
            class: info.name.clone(),
            slot,
        };
        let slot = m.slot.ok_or_else(|| missing(u16::MAX))?;
        let vslot = if self.class(m.class)?.is_interface() {
            info.interface_slots
                .iter()
                .find(|(i, _)| *i == m.class)
                .and_then(|(_, slots)| slots.get(slot as usize).copied())
                .filter(|&s| s != u16::MAX)
                .ok_or_else(|| missing(slot))?
        } else {
            slot
        };
        Ok(*info.vtable.get(vslot as usize).ok_or_else(|| missing(vslot))?)
    }

    /// Interpreted body of `method`, materialising a lazy body on first use.
    pub fn interp_info(&self, method: MethodHandle) -> Result<Arc<InterpMethodInfo>, VmError> {
        let m = self.method(method)?;
        if let Some(info) = m.interp.get() {
            return Ok(info.clone());
        }
        let info = match &m.body {
            MethodBody::Interpreted(InterpSource::Ready(info)) => info.clone(),
            MethodBody::Interpreted(InterpSource::Lazy(make)) => {
                tracing::debug!(method = %self.method_name(method), "materialising interpreted body");
                Arc::new(make(self)?)
            }
            MethodBody::OpenGeneric => {
                return Err(ExecutionError::UnresolvedGeneric(self.method_name(method)).into())
            }
            MethodBody::Abstract => {
                return Err(ExecutionError::AbstractMethod(self.method_name(method)).into())
            }
            _ => return Err(ExecutionError::MissingBody(self.method_name(method)).into()),
        };
        info.check_slots()?;
        // a racing thread may have won; either copy is equivalent
        Ok(m.interp.get_or_init(|| info).clone())
    }

    // ---- heap -------------------------------------------------------------

    pub fn object_class(&self, obj: ObjectRef) -> Result<ClassHandle, MemoryError> {
        Ok(self.heap.lock().get(obj)?.class)
    }

    pub(crate) fn alloc_instance_unchecked(&self, class: ClassHandle) -> ObjectRef {
        let size = self.class(class).map_or(0, |c| c.instance_size);
        let kind = if self.is_subclass(class, self.well_known.exception) {
            ObjectKind::Exception(Box::default())
        } else {
            ObjectKind::Instance
        };
        self.heap.lock().alloc(HeapObject {
            class,
            data: vec![0u8; size as usize].into_boxed_slice(),
            kind,
        })
    }

    /// Allocates a zeroed instance of a reference class.
    pub fn alloc_instance(&self, class: ClassHandle) -> Result<ObjectRef, VmError> {
        let info = self.class(class)?;
        match info.kind {
            ClassKind::Class | ClassKind::ValueType | ClassKind::Nullable(_) => {
                Ok(self.alloc_instance_unchecked(class))
            }
            _ => Err(TypeResolutionError::InvalidClass(class.0).into()),
        }
    }

    /// Boxes the raw bytes of a value type instance.
    pub fn box_value(&self, class: ClassHandle, bytes: &[u8]) -> Result<ObjectRef, VmError> {
        let size = self.class(class)?.instance_size as usize;
        let mut data = vec![0u8; size];
        let n = size.min(bytes.len());
        data[..n].copy_from_slice(&bytes[..n]);
        Ok(self.heap.lock().alloc(HeapObject {
            class,
            data: data.into_boxed_slice(),
            kind: ObjectKind::Instance,
        }))
    }

    pub fn new_array(&self, array_class: ClassHandle, length: u32) -> Result<ObjectRef, VmError> {
        self.new_md_array(array_class, &[length], &[])
    }

    pub fn new_md_array(&self, array_class: ClassHandle, lengths: &[u32], lower_bounds: &[i32]) -> Result<ObjectRef, VmError> {
        let info = self.class(array_class)?;
        let ClassKind::Array { element, .. } = info.kind else {
            return Err(TypeResolutionError::NotAnArray(info.name.clone()).into());
        };
        let element_size = self.type_size(element)?;
        let shape = ArrayShape {
            lengths: lengths.to_vec(),
            lower_bounds: lower_bounds.to_vec(),
            element_size,
        };
        let bytes = shape.total_len() * element_size as usize;
        Ok(self.heap.lock().alloc(HeapObject {
            class: array_class,
            data: vec![0u8; bytes].into_boxed_slice(),
            kind: ObjectKind::Array(shape),
        }))
    }

    pub fn intern(&self, value: &str) -> ObjectRef {
        self.heap.lock().intern(self.well_known.string, value)
    }

    pub fn new_string(&self, value: &str) -> ObjectRef {
        self.heap.lock().alloc(HeapObject {
            class: self.well_known.string,
            data: Box::new([]),
            kind: ObjectKind::String(value.into()),
        })
    }

    pub fn string_value(&self, obj: ObjectRef) -> Option<String> {
        self.heap.lock().get(obj).ok()?.as_str().map(str::to_string)
    }

    pub fn new_delegate(&self, class: ClassHandle, target: Option<ObjectRef>, method: MethodHandle) -> Result<ObjectRef, VmError> {
        let info = self.class(class)?;
        if !self.is_subclass(class, self.well_known.delegate) {
            return Err(TypeResolutionError::NotADelegate(info.name.clone()).into());
        }
        self.method(method)?;
        Ok(self.heap.lock().alloc(HeapObject {
            class,
            data: Box::new([]),
            kind: ObjectKind::Delegate(DelegateData {
                target,
                method,
                invocation_list: vec![],
            }),
        }))
    }

    /// `Delegate.Combine`: a new delegate invoking `a`'s targets, then `b`'s.
    pub fn combine_delegates(&self, a: Option<ObjectRef>, b: Option<ObjectRef>) -> Result<Option<ObjectRef>, VmError> {
        let (a, b) = match (a, b) {
            (None, x) | (x, None) => return Ok(x),
            (Some(a), Some(b)) => (a, b),
        };
        let mut heap = self.heap.lock();
        let expand = |heap: &Heap, d: ObjectRef| -> Result<Vec<ObjectRef>, VmError> {
            let obj = heap.get(d)?;
            let data = obj
                .delegate()
                .ok_or_else(|| TypeResolutionError::NotADelegate(format!("{d:?}")))?;
            Ok(if data.invocation_list.is_empty() {
                vec![d]
            } else {
                data.invocation_list.clone()
            })
        };
        let mut list = expand(&*heap, a)?;
        list.extend(expand(&*heap, b)?);
        let last = heap.get(*list.last().unwrap_or(&b))?;
        let class = last.class;
        let last_data = last
            .delegate()
            .cloned()
            .ok_or_else(|| TypeResolutionError::NotADelegate(format!("{b:?}")))?;
        Ok(Some(heap.alloc(HeapObject {
            class,
            data: Box::new([]),
            kind: ObjectKind::Delegate(DelegateData {
                invocation_list: list,
                ..last_data
            }),
        })))
    }

    /// Reads a field of a heap object at `offset`.
    pub fn read_field<T: SlotValue>(&self, obj: ObjectRef, offset: u32) -> Result<T, VmError> {
        let heap = self.heap.lock();
        let data = &heap.get(obj)?.data;
        let start = offset as usize;
        data.get(start..start + T::SIZE)
            .map(T::read_from)
            .ok_or_else(|| MemoryError::AccessViolation(offset as u64).into())
    }

    pub fn write_field<T: SlotValue>(&self, obj: ObjectRef, offset: u32, value: T) -> Result<(), VmError> {
        let mut heap = self.heap.lock();
        let data = &mut heap.get_mut(obj)?.data;
        let start = offset as usize;
        let dst = data
            .get_mut(start..start + T::SIZE)
            .ok_or(MemoryError::AccessViolation(offset as u64))?;
        value.write_to(dst);
        Ok(())
    }

    pub fn exception_details(&self, ex: ObjectRef) -> Option<ExceptionDetails> {
        self.heap.lock().get(ex).ok()?.exception().cloned()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Method pointer as stored in a slot by `ldftn`: the handle plus one, so zero stays null.
pub fn method_pointer(method: MethodHandle) -> StackObject {
    StackObject(method.0 as u64 + 1)
}

pub fn method_from_pointer(word: StackObject) -> Option<MethodHandle> {
    word.0
        .checked_sub(1)
        .and_then(|h| u32::try_from(h).ok())
        .map(MethodHandle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MethodDef;

    #[test]
    fn struct_fields_are_laid_out_naturally() {
        let mut rt = Runtime::with_config(InterpreterConfig::default());
        let s = rt
            .define_class(
                ClassDef::value_type("S")
                    .field("a", TypeDesc::U1)
                    .field("b", TypeDesc::I8)
                    .field("c", TypeDesc::I2),
            )
            .unwrap();
        let info = rt.class(s).unwrap();
        assert_eq!(info.field("b").unwrap().offset, 8);
        assert_eq!(info.field("c").unwrap().offset, 16);
        assert_eq!(info.instance_size, 24);
        assert_eq!(rt.type_slots(TypeDesc::Value(s)).unwrap(), 3);
    }

    #[test]
    fn overrides_share_the_base_slot() {
        let mut rt = Runtime::with_config(InterpreterConfig::default());
        let shape = rt.define_interface_for_test();
        let base = rt
            .define_class(ClassDef::class("Base").implements(shape))
            .unwrap();
        let derived = rt.define_class(ClassDef::class("Derived").extends(base)).unwrap();
        let iface_area = rt.find_method(shape, "Area").unwrap();
        let base_area = rt
            .define_method(MethodDef::new(base, "Area").virtual_method().returns(TypeDesc::I4))
            .unwrap();
        let derived_area = rt
            .define_method(MethodDef::new(derived, "Area").virtual_method().returns(TypeDesc::I4))
            .unwrap();
        let rt = rt.seal();
        assert_eq!(rt.resolve_virtual(base, iface_area).unwrap(), base_area);
        assert_eq!(rt.resolve_virtual(derived, iface_area).unwrap(), derived_area);
        assert_eq!(rt.resolve_virtual(derived, base_area).unwrap(), derived_area);
        assert!(rt.is_assignable(derived, shape));
        assert!(!rt.is_assignable(base, derived));
    }

    #[test]
    fn array_covariance() {
        let mut rt = Runtime::with_config(InterpreterConfig::default());
        let base = rt.define_class(ClassDef::class("Base")).unwrap();
        let derived = rt.define_class(ClassDef::class("Derived").extends(base)).unwrap();
        let base_arr = rt.define_array(TypeDesc::Object(base), 1).unwrap();
        let derived_arr = rt.define_array(TypeDesc::Object(derived), 1).unwrap();
        let int_arr = rt.define_array(TypeDesc::I4, 1).unwrap();
        assert!(rt.is_assignable(derived_arr, base_arr));
        assert!(!rt.is_assignable(base_arr, derived_arr));
        assert!(!rt.is_assignable(int_arr, base_arr));
        assert_eq!(rt.class(derived_arr).unwrap().name, "Derived[]");
    }

    #[test]
    fn method_pointers_keep_zero_as_null() {
        assert_eq!(method_from_pointer(StackObject(0)), None);
        let m = MethodHandle(3);
        assert_eq!(method_from_pointer(method_pointer(m)), Some(m));
    }

    impl Runtime {
        fn define_interface_for_test(&mut self) -> ClassHandle {
            let i = self.define_class(ClassDef::interface("IShape")).unwrap();
            self.define_method(MethodDef::new(i, "Area").returns(TypeDesc::I4))
                .unwrap();
            i
        }
    }
}
