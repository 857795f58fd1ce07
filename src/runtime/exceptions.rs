use crate::{
    runtime::Runtime,
    types::ClassHandle,
    value::{object::StackTraceEntry, ObjectRef},
};

/// Exceptions the engine raises on its own behalf.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    NullReference,
    DivideByZero,
    Overflow,
    IndexOutOfRange,
    InvalidCast,
    ArrayTypeMismatch,
    Arithmetic,
    TypeInitialization,
    NotSupported,
}

impl ExceptionKind {
    pub const ALL: [ExceptionKind; 9] = [
        ExceptionKind::NullReference,
        ExceptionKind::DivideByZero,
        ExceptionKind::Overflow,
        ExceptionKind::IndexOutOfRange,
        ExceptionKind::InvalidCast,
        ExceptionKind::ArrayTypeMismatch,
        ExceptionKind::Arithmetic,
        ExceptionKind::TypeInitialization,
        ExceptionKind::NotSupported,
    ];

    pub fn class_name(self) -> &'static str {
        match self {
            ExceptionKind::NullReference => "System.NullReferenceException",
            ExceptionKind::DivideByZero => "System.DivideByZeroException",
            ExceptionKind::Overflow => "System.OverflowException",
            ExceptionKind::IndexOutOfRange => "System.IndexOutOfRangeException",
            ExceptionKind::InvalidCast => "System.InvalidCastException",
            ExceptionKind::ArrayTypeMismatch => "System.ArrayTypeMismatchException",
            ExceptionKind::Arithmetic => "System.ArithmeticException",
            ExceptionKind::TypeInitialization => "System.TypeInitializationException",
            ExceptionKind::NotSupported => "System.NotSupportedException",
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ExceptionKind::NullReference => "Object reference not set to an instance of an object.",
            ExceptionKind::DivideByZero => "Attempted to divide by zero.",
            ExceptionKind::Overflow => "Arithmetic operation resulted in an overflow.",
            ExceptionKind::IndexOutOfRange => "Index was outside the bounds of the array.",
            ExceptionKind::InvalidCast => "Specified cast is not valid.",
            ExceptionKind::ArrayTypeMismatch => {
                "Attempted to access an element as a type incompatible with the array."
            }
            ExceptionKind::Arithmetic => "Overflow or underflow in the arithmetic operation.",
            ExceptionKind::TypeInitialization => "A type initializer threw an exception.",
            ExceptionKind::NotSupported => "Specified method is not supported.",
        }
    }

    /// Base class within the built-in exception hierarchy.
    pub(crate) fn parent(self) -> Option<ExceptionKind> {
        match self {
            ExceptionKind::DivideByZero | ExceptionKind::Overflow => Some(ExceptionKind::Arithmetic),
            _ => None,
        }
    }
}

impl Runtime {
    pub fn exception_class(&self, kind: ExceptionKind) -> ClassHandle {
        self.well_known.exception_kinds[kind as usize]
    }

    /// Allocates an exception object of a built-in kind.
    pub fn new_exception(&self, kind: ExceptionKind, message: Option<String>) -> ObjectRef {
        let message = message.unwrap_or_else(|| kind.default_message().to_string());
        self.new_exception_of(self.exception_class(kind), Some(message))
    }

    /// Allocates an exception of any class deriving from `System.Exception`.
    pub fn new_exception_of(&self, class: ClassHandle, message: Option<String>) -> ObjectRef {
        let obj = self.alloc_instance_unchecked(class);
        if let Ok(o) = self.heap.lock().get_mut(obj) {
            if let Some(details) = o.exception_mut() {
                details.message = message;
            }
        }
        obj
    }

    pub fn exception_message(&self, ex: ObjectRef) -> Option<String> {
        let heap = self.heap.lock();
        heap.get(ex).ok()?.exception()?.message.clone()
    }

    pub fn stack_trace(&self, ex: ObjectRef) -> Vec<StackTraceEntry> {
        let heap = self.heap.lock();
        heap.get(ex)
            .ok()
            .and_then(|o| o.exception())
            .map(|d| d.stack_trace.clone())
            .unwrap_or_default()
    }

    /// Stores `trace` on the exception unless one was captured already, so a
    /// rethrow keeps the original throw site.
    pub(crate) fn record_stack_trace(&self, ex: ObjectRef, trace: impl FnOnce() -> Vec<StackTraceEntry>) {
        let mut heap = self.heap.lock();
        if let Some(details) = heap.get_mut(ex).ok().and_then(|o| o.exception_mut()) {
            if details.stack_trace.is_empty() {
                details.stack_trace = trace();
            }
        }
    }

    /// `Type: message` summary used by the CLI and in logs.
    pub fn describe_exception(&self, ex: ObjectRef) -> String {
        let class = self
            .object_class(ex)
            .ok()
            .and_then(|c| self.class(c).ok())
            .map_or("<invalid>", |c| c.name.as_str());
        match self.exception_message(ex) {
            Some(msg) => format!("{class}: {msg}"),
            None => class.to_string(),
        }
    }
}
