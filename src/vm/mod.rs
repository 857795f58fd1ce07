//! The register-based interpreter.
//!
//! An [`Interpreter`] binds a sealed [`Runtime`] to the calling thread's
//! evaluation stack. Each [`Interpreter::execute`] call pushes a group of
//! interpreted frames and runs them in one dispatch loop until the outermost
//! frame returns or an exception escapes it.
use crate::{
    runtime::{init::ensure_initialized, Runtime},
    types::{MethodBody, MethodHandle, TypeDesc},
    value::StackObject,
    vm::{
        context::ExecContext,
        error::{ExecuteError, ExecutionError, VmError},
        frame::{ArgSource, InterpFrameGroup, RetTarget},
        memory::Memory,
        method_info::InterpMethodInfo,
        stack::MachineState,
        tracer::Tracer,
    },
};
use parking_lot::MutexGuard;
use std::{borrow::Cow, sync::Arc};

#[macro_use]
mod macros;
pub mod abi;
pub(crate) mod bridge;
pub mod builder;
pub mod context;
pub mod error;
pub mod exceptions;
mod executor;
pub mod frame;
pub mod instructions;
pub mod memory;
pub mod method_info;
pub mod metrics;
pub mod opcodes;
pub mod pinvoke;
pub mod stack;
pub mod tracer;

pub use executor::StepResult;

pub struct Interpreter {
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) machine: MachineState,
}

impl Interpreter {
    /// Binds `runtime` to this thread's evaluation stack.
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let machine = MachineState::acquire(runtime.config());
        Self { runtime, machine }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Evaluation stack of this thread, e.g. for scanning live slots.
    pub fn machine(&self) -> &MachineState {
        &self.machine
    }

    pub fn tracer_enabled(&self) -> bool {
        self.runtime.tracer_enabled()
    }

    pub fn tracer(&self) -> MutexGuard<'_, Tracer> {
        self.runtime.tracer()
    }

    pub fn indent(&self) -> usize {
        self.machine.frames.len()
    }

    /// Runs `method` with host-layout `args` (one slot per argument, `this`
    /// first, by-reference value types as addresses) and writes its result
    /// slots to `ret`.
    ///
    /// A managed exception nothing catches comes back as
    /// [`ExecuteError::Unhandled`]; every interpreted frame this call pushed
    /// is gone by then.
    pub fn execute(
        &mut self,
        method: MethodHandle,
        args: &[StackObject],
        ret: &mut [StackObject],
    ) -> Result<(), ExecuteError> {
        let rt = self.runtime.clone();
        let desc = rt.method(method).map_err(VmError::from)?;
        if desc.flags.is_static {
            ensure_initialized(self, desc.class)?;
        }
        if matches!(desc.body, MethodBody::Native(_) | MethodBody::Foreign(_)) {
            return Ok(bridge::call_host_native(self, method, args, ret)?);
        }

        let info = rt.interp_info(method)?;
        let expected = info.host_arg_slots();
        if args.len() != expected {
            return Err(VmError::from(ExecutionError::ArgumentCountMismatch {
                method: info.name.clone(),
                expected,
                actual: args.len(),
            })
            .into());
        }
        let frame_args = if info.is_trivial_copy_args {
            Cow::Borrowed(args)
        } else {
            let mut mem = Memory::new(&rt, &mut self.machine);
            Cow::Owned(bridge::copy_args(&mut mem, &info.args, args)?)
        };
        self.run_interpreted(info, &frame_args, ret)
    }

    /// Convenience wrapper around [`execute`](Self::execute) returning the
    /// first result slot.
    pub fn call(&mut self, method: MethodHandle, args: &[StackObject]) -> Result<StackObject, ExecuteError> {
        let rt = self.runtime.clone();
        let ret = rt.method(method).map_err(VmError::from)?.ret;
        let slots = match ret {
            TypeDesc::Void => 1,
            ty => rt.type_slots(ty).map_err(VmError::from)?.max(1),
        };
        let mut buf = vec![StackObject::ZERO; slots];
        self.execute(method, args, &mut buf)?;
        Ok(buf[0])
    }

    /// Runs an interpreted body whose arguments are already in frame layout.
    pub(crate) fn run_interpreted(
        &mut self,
        info: Arc<InterpMethodInfo>,
        frame_args: &[StackObject],
        ret: &mut [StackObject],
    ) -> Result<(), ExecuteError> {
        let group = InterpFrameGroup::new(&self.machine);
        group
            .enter_frame(&mut self.machine, info, ArgSource::Slots(frame_args), RetTarget::Host)?;
        self.runtime.metrics().record_frame_entered();
        let mut ctx = ExecContext::new(self, group, ret).map_err(VmError::from)?;
        executor::run(&mut ctx)
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        std::mem::replace(&mut self.machine, MachineState::new(0, 0)).release();
    }
}
