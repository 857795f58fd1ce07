//! Host type model consumed by the engine: class and method descriptors,
//! signatures and field layout.
use crate::runtime::init::ClassInitCell;
use std::fmt::{self, Debug, Formatter};

pub mod layout;
pub mod members;

pub use members::{
    ForeignEntry, InterpSource, MethodBody, MethodDef, MethodDesc, MethodFlags, NativeFn,
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassHandle(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodHandle(pub u32);

impl Debug for ClassHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

impl Debug for MethodHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "method#{}", self.0)
    }
}

/// Static type of a parameter, local, field or array element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeDesc {
    Void,
    Bool,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    IntPtr,
    UIntPtr,
    /// Managed or unmanaged pointer.
    Ptr,
    /// Reference to an instance of a class, interface, array, string or delegate.
    Object(ClassHandle),
    /// Value type stored inline.
    Value(ClassHandle),
}

impl TypeDesc {
    pub fn is_reference(self) -> bool {
        matches!(self, TypeDesc::Object(_))
    }

    /// Size and alignment of non-value-type descriptors.
    pub fn primitive_layout(self) -> Option<(u32, u32)> {
        use TypeDesc::*;
        Some(match self {
            Void => (0, 1),
            Bool | I1 | U1 => (1, 1),
            Char | I2 | U2 => (2, 2),
            I4 | U4 | R4 => (4, 4),
            I8 | U8 | R8 | IntPtr | UIntPtr | Ptr | Object(_) => (8, 8),
            Value(_) => return None,
        })
    }

    pub fn is_float(self) -> bool {
        matches!(self, TypeDesc::R4 | TypeDesc::R8)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    ValueType,
    Interface,
    /// Rank 1 arrays are zero-based vectors; higher ranks carry bounds.
    Array {
        element: TypeDesc,
        rank: u8,
    },
    Delegate,
    /// `Nullable<T>` over the given value type: `{ has_value: bool, value: T }`.
    Nullable(ClassHandle),
    String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldStorage {
    Instance,
    Static,
    ThreadStatic,
}

#[derive(Clone, Debug)]
pub struct FieldInfo {
    pub name: String,
    pub ty: TypeDesc,
    pub storage: FieldStorage,
    /// Byte offset within instance data, the static block or the thread-static block.
    pub offset: u32,
}

pub struct ClassInfo {
    pub name: String,
    pub parent: Option<ClassHandle>,
    pub kind: ClassKind,
    pub interfaces: Vec<ClassHandle>,
    pub fields: Vec<FieldInfo>,
    pub instance_size: u32,
    pub instance_align: u32,
    pub contains_refs: bool,
    pub static_size: u32,
    pub thread_static_size: u32,
    pub cctor: Option<MethodHandle>,
    pub methods: Vec<MethodHandle>,
    pub vtable: Vec<MethodHandle>,
    /// For each implemented interface, the vtable slot backing each interface slot.
    pub interface_slots: Vec<(ClassHandle, Vec<u16>)>,
    pub(crate) init: ClassInitCell,
}

impl ClassInfo {
    pub fn is_value_type(&self) -> bool {
        matches!(self.kind, ClassKind::ValueType | ClassKind::Nullable(_))
    }

    pub fn is_interface(&self) -> bool {
        matches!(self.kind, ClassKind::Interface)
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn element_type(&self) -> Option<TypeDesc> {
        match self.kind {
            ClassKind::Array { element, .. } => Some(element),
            _ => None,
        }
    }
}

impl Debug for ClassInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassInfo")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("instance_size", &self.instance_size)
            .finish_non_exhaustive()
    }
}

/// Declarative description of a class handed to
/// [`Runtime::define_class`](crate::runtime::Runtime::define_class).
#[derive(Clone, Debug)]
pub struct ClassDef {
    pub(crate) name: String,
    pub(crate) parent: Option<ClassHandle>,
    pub(crate) kind: ClassKind,
    pub(crate) interfaces: Vec<ClassHandle>,
    pub(crate) fields: Vec<(String, TypeDesc, FieldStorage)>,
}

impl ClassDef {
    fn new(name: impl Into<String>, kind: ClassKind) -> Self {
        Self {
            name: name.into(),
            parent: None,
            kind,
            interfaces: vec![],
            fields: vec![],
        }
    }

    pub fn class(name: impl Into<String>) -> Self {
        Self::new(name, ClassKind::Class)
    }

    pub fn value_type(name: impl Into<String>) -> Self {
        Self::new(name, ClassKind::ValueType)
    }

    pub fn interface(name: impl Into<String>) -> Self {
        Self::new(name, ClassKind::Interface)
    }

    pub fn delegate(name: impl Into<String>) -> Self {
        Self::new(name, ClassKind::Delegate)
    }

    pub fn extends(mut self, parent: ClassHandle) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn implements(mut self, interface: ClassHandle) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn field(mut self, name: impl Into<String>, ty: TypeDesc) -> Self {
        self.fields.push((name.into(), ty, FieldStorage::Instance));
        self
    }

    pub fn static_field(mut self, name: impl Into<String>, ty: TypeDesc) -> Self {
        self.fields.push((name.into(), ty, FieldStorage::Static));
        self
    }

    pub fn thread_static_field(mut self, name: impl Into<String>, ty: TypeDesc) -> Self {
        self.fields
            .push((name.into(), ty, FieldStorage::ThreadStatic));
        self
    }
}
