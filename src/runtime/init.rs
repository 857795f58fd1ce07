//! Run-once static constructors.
use crate::{
    runtime::exceptions::ExceptionKind,
    types::ClassHandle,
    value::ObjectRef,
    vm::{
        error::{ExecuteError, Fault},
        Interpreter,
    },
    vm_msg,
};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread::{self, ThreadId},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InitState {
    Uninit,
    Running(ThreadId),
    Done,
    Failed(ObjectRef),
}

pub(crate) struct ClassInitCell {
    done: AtomicBool,
    state: Mutex<InitState>,
    cond: Condvar,
}

impl Default for ClassInitCell {
    fn default() -> Self {
        Self {
            done: AtomicBool::new(false),
            state: Mutex::new(InitState::Uninit),
            cond: Condvar::new(),
        }
    }
}

impl ClassInitCell {
    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Makes sure the static constructor of `class` has run.
///
/// Other threads block until the initialising thread finishes. The
/// initialising thread itself passes straight through, which is what lets a
/// static constructor touch its own statics. A constructor that throws leaves
/// the class permanently failed with a `TypeInitializationException`.
pub(crate) fn ensure_initialized(interp: &mut Interpreter, class: ClassHandle) -> Result<(), Fault> {
    let rt = interp.runtime().clone();
    let info = rt.class(class)?;
    if info.init.is_done() {
        return Ok(());
    }
    let me = thread::current().id();
    {
        let mut state = info.init.state.lock();
        loop {
            match *state {
                InitState::Done => return Ok(()),
                InitState::Failed(ex) => return Err(Fault::Managed(ex)),
                InitState::Running(owner) if owner == me => return Ok(()),
                InitState::Running(_) => info.init.cond.wait(&mut state),
                InitState::Uninit => {
                    *state = InitState::Running(me);
                    break;
                }
            }
        }
    }

    let outcome = match info.cctor {
        Some(cctor) => {
            tracing::debug!(class = %info.name, "running static constructor");
            vm_msg!(interp, "static constructor of {}", info.name);
            interp.execute(cctor, &[], &mut [])
        }
        None => Ok(()),
    };

    let mut state = info.init.state.lock();
    let result = match outcome {
        Ok(()) => {
            *state = InitState::Done;
            info.init.done.store(true, Ordering::Release);
            rt.metrics().record_class_init();
            Ok(())
        }
        Err(ExecuteError::Unhandled(inner)) => {
            let inner_msg = rt.exception_message(inner).unwrap_or_default();
            let ex = rt.new_exception(
                ExceptionKind::TypeInitialization,
                Some(format!(
                    "The type initializer for '{}' threw an exception: {}",
                    info.name, inner_msg
                )),
            );
            tracing::warn!(class = %info.name, "static constructor failed");
            *state = InitState::Failed(ex);
            Err(Fault::Managed(ex))
        }
        Err(ExecuteError::Vm(e)) => {
            // fatal errors leave the class retryable
            *state = InitState::Uninit;
            Err(Fault::Vm(e))
        }
    };
    info.init.cond.notify_all();
    result
}
