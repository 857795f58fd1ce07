use crate::value::ObjectRef;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    #[error("Method execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Malformed bytecode: {0}")]
    Decode(#[from] DecodeError),

    #[error("Type resolution failed: {0}")]
    TypeResolution(#[from] TypeResolutionError),

    #[error("Memory access violation: {0}")]
    Memory(#[from] MemoryError),

    #[error("Native call failed: {0}")]
    Native(#[from] NativeError),

    #[error("Bytecode emission failed: {0}")]
    Build(#[from] BuildError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Evaluation stack overflow: {requested} slots requested, capacity {capacity}")]
    StackOverflow { requested: usize, capacity: usize },

    #[error("Invalid opcode {opcode:#06x} at IL_{offset:04x}")]
    InvalidOpcode { offset: usize, opcode: u16 },

    #[error("Argument count mismatch calling {method}: expected {expected} slots, got {actual}")]
    ArgumentCountMismatch {
        method: String,
        expected: usize,
        actual: usize,
    },

    #[error("Generic method {0} reached without instantiation")]
    UnresolvedGeneric(String),

    #[error("Abstract method {0} has no implementation")]
    AbstractMethod(String),

    #[error("Method {0} has no body")]
    MissingBody(String),

    #[error("No exception flow active at IL_{offset:04x}")]
    NoActiveExceptionFlow { offset: usize },

    #[error("Resolve data #{index} has the wrong shape")]
    InvalidResolveData { index: u32 },

    #[error("Corrupt frame state: {0}")]
    CorruptFrame(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Instruction at IL_{offset:04x} is truncated")]
    Truncated { offset: usize },

    #[error("Unknown opcode {opcode:#06x} at IL_{offset:04x}")]
    UnknownOpcode { offset: usize, opcode: u16 },

    #[error("Invalid operand in instruction at IL_{offset:04x}")]
    BadOperand { offset: usize },

    #[error("Branch at IL_{offset:04x} targets IL_{target:04x}, which is not an instruction boundary")]
    BadBranchTarget { offset: usize, target: usize },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeResolutionError {
    #[error("Invalid class handle {0}")]
    InvalidClass(u32),
    #[error("Invalid method handle {0}")]
    InvalidMethod(u32),
    #[error("{0} is not an array type")]
    NotAnArray(String),
    #[error("{0} is not a delegate type")]
    NotADelegate(String),
    #[error("Virtual slot {slot} missing on {class}")]
    MissingSlot { class: String, slot: u16 },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MemoryError {
    #[error("Access violation at {0:#x}")]
    AccessViolation(u64),
    #[error("Dangling object reference {0}")]
    InvalidObject(u64),
    #[error("Slot {slot} outside a frame of {frame_slots} slots")]
    SlotOutOfFrame { slot: usize, frame_slots: usize },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NativeError {
    #[error("Could not load library {name}: {reason}")]
    LibraryLoad { name: String, reason: String },
    #[error("Symbol {symbol} not found in {library}")]
    SymbolNotFound { library: String, symbol: String },
    #[error("Marshalling not supported for {0}")]
    Unsupported(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BuildError {
    #[error("Label {0} was never placed")]
    UnboundLabel(usize),
    #[error("Frame needs {0} slots, more than a slot index can address")]
    TooManySlots(usize),
    #[error("Argument {0} out of range")]
    NoSuchArgument(usize),
    #[error("Local {0} out of range")]
    NoSuchLocal(usize),
    #[error("Slot {slot} used at IL_{offset:04x} lies outside the {frame_slots}-slot frame")]
    SlotOutOfFrame {
        offset: usize,
        slot: usize,
        frame_slots: usize,
    },
}

/// Outcome of a failing operation inside the engine.
///
/// `Managed` faults are ordinary managed exceptions and get routed through the
/// exception flow machine. `Vm` faults abort the whole invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    Managed(ObjectRef),
    Vm(VmError),
}

macro_rules! fault_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Fault {
                fn from(e: $t) -> Self {
                    Fault::Vm(e.into())
                }
            }
        )*
    };
}

fault_from!(
    VmError,
    ExecutionError,
    DecodeError,
    TypeResolutionError,
    MemoryError,
    NativeError
);

/// Error returned from [`Interpreter::execute`](crate::vm::Interpreter::execute).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecuteError {
    /// A managed exception unwound through every interpreted frame of the call.
    #[error("Unhandled managed exception {0:?}")]
    Unhandled(ObjectRef),
    #[error(transparent)]
    Vm(#[from] VmError),
}

impl From<ExecuteError> for Fault {
    fn from(e: ExecuteError) -> Self {
        match e {
            ExecuteError::Unhandled(ex) => Fault::Managed(ex),
            ExecuteError::Vm(e) => Fault::Vm(e),
        }
    }
}

impl From<Fault> for ExecuteError {
    fn from(f: Fault) -> Self {
        match f {
            Fault::Managed(ex) => ExecuteError::Unhandled(ex),
            Fault::Vm(e) => ExecuteError::Vm(e),
        }
    }
}
