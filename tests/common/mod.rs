#![allow(dead_code)]

use hybrid_interp::{
    config::InterpreterConfig,
    runtime::Runtime,
    types::{ClassDef, ClassHandle, MethodDef, MethodHandle, TypeDesc},
    value::StackObject,
    vm::{
        builder::InterpMethodBuilder,
        error::{ExecuteError, Fault, VmError},
        Interpreter,
    },
};
use parking_lot::Mutex;
use std::sync::Arc;

/// A runtime under construction with one scratch class for test methods.
pub struct TestHarness {
    pub rt: Runtime,
    pub class: ClassHandle,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(InterpreterConfig::default())
    }

    pub fn with_config(config: InterpreterConfig) -> Self {
        let mut rt = Runtime::with_config(config);
        let class = rt.define_class(ClassDef::class("Tests")).unwrap();
        Self { rt, class }
    }

    pub fn method(&mut self, name: &str, params: &[TypeDesc], ret: TypeDesc) -> MethodHandle {
        self.rt
            .define_method(
                MethodDef::new(self.class, name)
                    .params(params.iter().copied())
                    .returns(ret),
            )
            .unwrap()
    }

    pub fn native(
        &mut self,
        name: &str,
        params: &[TypeDesc],
        ret: TypeDesc,
        f: impl Fn(&mut Interpreter, &[StackObject], &mut [StackObject]) -> Result<(), Fault> + Send + Sync + 'static,
    ) -> MethodHandle {
        self.rt
            .define_method(
                MethodDef::new(self.class, name)
                    .params(params.iter().copied())
                    .returns(ret)
                    .native(f),
            )
            .unwrap()
    }

    /// A native `Log(int)` appending its argument to the returned list.
    pub fn recorder(&mut self) -> (MethodHandle, Arc<Mutex<Vec<i32>>>) {
        let log = Arc::new(Mutex::new(vec![]));
        let sink = log.clone();
        let m = self.native("Log", &[TypeDesc::I4], TypeDesc::Void, move |_, args, _| {
            sink.lock().push(args[0].as_i32());
            Ok(())
        });
        (m, log)
    }

    /// A class deriving from `System.Exception`.
    pub fn exception_class(&mut self, name: &str) -> ClassHandle {
        let base = self.rt.exception_base();
        self.rt
            .define_class(ClassDef::class(name).extends(base))
            .unwrap()
    }

    /// Assembles an interpreted body for `method` and installs it.
    pub fn body(
        &mut self,
        method: MethodHandle,
        locals: &[TypeDesc],
        emit: impl FnOnce(&mut InterpMethodBuilder) -> Result<(), VmError>,
    ) {
        let mut b = InterpMethodBuilder::new(&self.rt, method, locals).unwrap();
        emit(&mut b).unwrap();
        let info = b.finish().unwrap();
        self.rt.set_interp_body(method, info).unwrap();
    }

    pub fn seal(self) -> (Arc<Runtime>, Interpreter) {
        let rt = self.rt.seal();
        let interp = Interpreter::new(rt.clone());
        (rt, interp)
    }
}

pub fn i32s(values: &[i32]) -> Vec<StackObject> {
    values.iter().map(|&v| StackObject::from_i32(v)).collect()
}

/// Class name of an unhandled exception, panicking on anything else.
pub fn unhandled_class(rt: &Runtime, result: Result<StackObject, ExecuteError>) -> String {
    match result {
        Err(ExecuteError::Unhandled(ex)) => {
            let class = rt.object_class(ex).unwrap();
            rt.class(class).unwrap().name.clone()
        }
        other => panic!("expected an unhandled exception, got {other:?}"),
    }
}
