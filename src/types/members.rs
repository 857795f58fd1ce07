use crate::{
    runtime::Runtime,
    types::{ClassHandle, TypeDesc},
    value::StackObject,
    vm::{
        error::{Fault, VmError},
        method_info::InterpMethodInfo,
        Interpreter,
    },
};
use std::{
    fmt::{self, Debug, Formatter},
    sync::{Arc, OnceLock},
};

/// Natively compiled implementation written in Rust.
///
/// Arguments arrive in host layout: one slot per argument, `this` first for
/// instance methods, and value types passed by reference arrive as the
/// address of the caller's copy. The return value is written to the start of
/// the second slice; small integers may be left unextended.
pub type NativeFn =
    Arc<dyn Fn(&mut Interpreter, &[StackObject], &mut [StackObject]) -> Result<(), Fault> + Send + Sync>;

pub type LazyBody = Box<dyn Fn(&Runtime) -> Result<InterpMethodInfo, VmError> + Send + Sync>;

pub enum InterpSource {
    Ready(Arc<InterpMethodInfo>),
    /// Produced on first use and cached on the method descriptor.
    Lazy(LazyBody),
}

/// Entry point of a C function reached through libffi.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForeignEntry {
    Address(usize),
    Symbol { library: String, symbol: String },
}

pub enum MethodBody {
    Interpreted(InterpSource),
    Native(NativeFn),
    Foreign(ForeignEntry),
    Abstract,
    /// Generic definition without instantiation; reaching it is fatal.
    OpenGeneric,
}

impl Debug for MethodBody {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MethodBody::Interpreted(InterpSource::Ready(_)) => write!(f, "interpreted"),
            MethodBody::Interpreted(InterpSource::Lazy(_)) => write!(f, "interpreted (lazy)"),
            MethodBody::Native(_) => write!(f, "native"),
            MethodBody::Foreign(e) => write!(f, "foreign({e:?})"),
            MethodBody::Abstract => write!(f, "abstract"),
            MethodBody::OpenGeneric => write!(f, "open generic"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MethodFlags {
    pub is_static: bool,
    pub is_virtual: bool,
    /// Always takes a new vtable slot instead of overriding an inherited one.
    pub new_slot: bool,
    pub is_ctor: bool,
}

pub struct MethodDesc {
    pub name: String,
    pub class: ClassHandle,
    /// Declared parameters, not counting `this`.
    pub params: Vec<TypeDesc>,
    pub ret: TypeDesc,
    pub flags: MethodFlags,
    /// Vtable slot (or interface slot for interface methods), assigned when the runtime is sealed.
    pub slot: Option<u16>,
    pub body: MethodBody,
    pub(crate) interp: OnceLock<Arc<InterpMethodInfo>>,
    pub(crate) foreign: OnceLock<usize>,
    pub(crate) this_type: TypeDesc,
}

impl MethodDesc {
    pub fn is_interpreted(&self) -> bool {
        matches!(self.body, MethodBody::Interpreted(_))
    }

    pub fn has_this(&self) -> bool {
        !self.flags.is_static
    }

    /// Full parameter list as laid out in argument slots, `this` included.
    pub fn arg_types(&self) -> impl Iterator<Item = TypeDesc> + '_ {
        self.has_this()
            .then_some(self.this_type)
            .into_iter()
            .chain(self.params.iter().copied())
    }
}

impl Debug for MethodDesc {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDesc")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("params", &self.params)
            .field("ret", &self.ret)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

/// Builder-style description of a method handed to
/// [`Runtime::define_method`](crate::runtime::Runtime::define_method).
pub struct MethodDef {
    pub(crate) class: ClassHandle,
    pub(crate) name: String,
    pub(crate) params: Vec<TypeDesc>,
    pub(crate) ret: TypeDesc,
    pub(crate) flags: MethodFlags,
    pub(crate) body: MethodBody,
}

impl MethodDef {
    /// A static method with no parameters, returning void and an abstract body.
    pub fn new(class: ClassHandle, name: impl Into<String>) -> Self {
        Self {
            class,
            name: name.into(),
            params: vec![],
            ret: TypeDesc::Void,
            flags: MethodFlags {
                is_static: true,
                ..Default::default()
            },
            body: MethodBody::Abstract,
        }
    }

    pub fn params(mut self, params: impl IntoIterator<Item = TypeDesc>) -> Self {
        self.params = params.into_iter().collect();
        self
    }

    pub fn returns(mut self, ret: TypeDesc) -> Self {
        self.ret = ret;
        self
    }

    pub fn instance(mut self) -> Self {
        self.flags.is_static = false;
        self
    }

    pub fn virtual_method(mut self) -> Self {
        self.flags.is_static = false;
        self.flags.is_virtual = true;
        self
    }

    pub fn new_slot(mut self) -> Self {
        self.flags.new_slot = true;
        self
    }

    pub fn constructor(mut self) -> Self {
        self.flags.is_static = false;
        self.flags.is_ctor = true;
        self
    }

    pub fn native(
        mut self,
        f: impl Fn(&mut Interpreter, &[StackObject], &mut [StackObject]) -> Result<(), Fault>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.body = MethodBody::Native(Arc::new(f));
        self
    }

    pub fn foreign(mut self, entry: ForeignEntry) -> Self {
        self.body = MethodBody::Foreign(entry);
        self
    }

    pub fn open_generic(mut self) -> Self {
        self.body = MethodBody::OpenGeneric;
        self
    }

    pub fn body(mut self, body: MethodBody) -> Self {
        self.body = body;
        self
    }
}
