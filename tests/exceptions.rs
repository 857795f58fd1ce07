mod common;

use common::{unhandled_class, TestHarness};
use hybrid_interp::{
    runtime::{exceptions::ExceptionKind, Runtime},
    types::{ClassDef, MethodDef, MethodHandle, TypeDesc},
    value::StackObject,
    vm::{
        builder::{Handler, InterpMethodBuilder},
        error::ExecuteError,
        opcodes::Instruction as I,
    },
};
use std::sync::Arc;

/// Emits `Log(value)` through a scratch temporary.
fn log(b: &mut InterpMethodBuilder, log: MethodHandle, value: i32) {
    let t = b.eval(7);
    b.emit(I::LdcI4 { dst: t, value });
    b.emit(I::CallNativeVoid { method: log, arg_base: t });
}

#[test]
fn innermost_matching_catch_runs_after_intervening_finally() {
    let mut h = TestHarness::new();
    let (log_m, recorded) = h.recorder();
    let thrown = h.exception_class("MyError");
    let other = h.exception_class("OtherError");
    let base = h.rt.exception_base();
    let m = h.method("Run", &[], TypeDesc::I4);
    h.body(m, &[], |b| {
        let (e, r) = (b.eval(0), b.eval(1));
        let (inner_finally, middle_catch, outer_catch, after) =
            (b.new_label(), b.new_label(), b.new_label(), b.new_label());

        let outer_try = b.here();
        let middle_try = b.here();
        let inner_try = b.here();
        b.emit(I::NewObjNoCtor { dst: e, class: thrown });
        b.emit(I::Throw { ex: e });
        b.place(inner_finally);
        log(b, log_m, 1);
        b.emit(I::EndFinally {});
        b.place(middle_catch);
        log(b, log_m, 2);
        b.emit_branch(|target| I::Leave { target }, after);
        b.place(outer_catch);
        // the handler sees the thrown object
        let ex = b.exception_slot();
        b.emit(I::IsInst {
            dst: e,
            obj: ex,
            class: thrown,
        });
        b.emit(I::Ldnull { dst: r });
        b.emit(I::CgtUnI8 { dst: r, a: e, b: r });
        b.emit(I::CallNativeVoid { method: log_m, arg_base: r });
        log(b, log_m, 3);
        b.emit_branch(|target| I::Leave { target }, after);
        b.place(after);
        b.emit(I::LdcI4 { dst: r, value: 42 });
        b.emit(I::Ret { src: r });

        b.add_clause(Handler::Finally, (inner_try, inner_finally), (inner_finally, middle_catch));
        b.add_clause(Handler::Catch(other), (middle_try, middle_catch), (middle_catch, outer_catch));
        b.add_clause(Handler::Catch(base), (outer_try, outer_catch), (outer_catch, after));
        Ok(())
    });
    let (_, mut interp) = h.seal();
    assert_eq!(interp.call(m, &[]).unwrap().as_i32(), 42);
    assert_eq!(*recorded.lock(), vec![1, 1, 3]);
}

#[test]
fn leave_runs_nested_finally_blocks_innermost_first() {
    let mut h = TestHarness::new();
    let (log_m, recorded) = h.recorder();
    let m = h.method("Run", &[], TypeDesc::Void);
    h.body(m, &[], |b| {
        let (f_inner, f_middle, f_outer, after) = (b.new_label(), b.new_label(), b.new_label(), b.new_label());
        let outer_try = b.here();
        let middle_try = b.here();
        let inner_try = b.here();
        b.emit_branch(|target| I::Leave { target }, after);
        b.place(f_inner);
        log(b, log_m, 1);
        b.emit(I::EndFinally {});
        b.place(f_middle);
        log(b, log_m, 2);
        b.emit(I::EndFinally {});
        b.place(f_outer);
        log(b, log_m, 3);
        b.emit(I::EndFinally {});
        b.place(after);
        b.emit(I::RetVoid {});

        b.add_clause(Handler::Finally, (inner_try, f_inner), (f_inner, f_middle));
        b.add_clause(Handler::Finally, (middle_try, f_middle), (f_middle, f_outer));
        b.add_clause(Handler::Finally, (outer_try, f_outer), (f_outer, after));
        Ok(())
    });
    let (_, mut interp) = h.seal();
    interp.call(m, &[]).unwrap();
    assert_eq!(*recorded.lock(), vec![1, 2, 3]);
}

#[test]
fn leave_within_a_try_skips_its_finally() {
    let mut h = TestHarness::new();
    let (log_m, recorded) = h.recorder();
    let m = h.method("Run", &[], TypeDesc::Void);
    h.body(m, &[], |b| {
        let (inside, handler, after) = (b.new_label(), b.new_label(), b.new_label());
        let try_start = b.here();
        b.emit_branch(|target| I::Leave { target }, inside);
        b.place(inside);
        log(b, log_m, 1);
        b.emit_branch(|target| I::Leave { target }, after);
        b.place(handler);
        log(b, log_m, 2);
        b.emit(I::EndFinally {});
        b.place(after);
        b.emit(I::RetVoid {});
        b.add_clause(Handler::Finally, (try_start, handler), (handler, after));
        Ok(())
    });
    let (_, mut interp) = h.seal();
    interp.call(m, &[]).unwrap();
    assert_eq!(*recorded.lock(), vec![1, 2]);
}

#[test]
fn finally_runs_once_and_exception_reaches_caller() {
    let mut h = TestHarness::new();
    let (log_m, recorded) = h.recorder();
    let thrown = h.exception_class("E");
    let m = h.method("ThrowWithFinally", &[], TypeDesc::Void);
    h.body(m, &[], |b| {
        let e = b.eval(0);
        let (handler, end) = (b.new_label(), b.new_label());
        let try_start = b.here();
        b.emit(I::NewObjNoCtor { dst: e, class: thrown });
        b.emit(I::Throw { ex: e });
        b.place(handler);
        log(b, log_m, 7);
        b.emit(I::EndFinally {});
        b.place(end);
        b.add_clause(Handler::Finally, (try_start, handler), (handler, end));
        Ok(())
    });
    let (rt, mut interp) = h.seal();
    let result = interp.call(m, &[]);
    assert_eq!(unhandled_class(&rt, result), "E");
    assert_eq!(*recorded.lock(), vec![7]);
    // nothing is left on the evaluation stack
    assert!(interp.machine().frames().is_empty());
    assert_eq!(interp.machine().top(), 0);
}

#[test]
fn exception_from_callee_is_caught_around_the_call() {
    let mut h = TestHarness::new();
    let thrown = h.exception_class("E");
    let inner = h.method("Inner", &[], TypeDesc::Void);
    let outer = h.method("Outer", &[], TypeDesc::I4);
    h.body(inner, &[], |b| {
        let e = b.eval(0);
        b.emit(I::NewObjNoCtor { dst: e, class: thrown });
        b.emit(I::Throw { ex: e });
        Ok(())
    });
    h.body(outer, &[TypeDesc::I4], |b| {
        let r = b.local(0)?;
        let (handler, after) = (b.new_label(), b.new_label());
        let args = b.eval(0);
        let try_start = b.here();
        b.emit(I::CallInterpVoid {
            method: inner,
            arg_base: args,
        });
        b.emit(I::LdcI4 { dst: r, value: 1 });
        b.emit_branch(|target| I::Leave { target }, after);
        b.place(handler);
        b.emit(I::LdcI4 { dst: r, value: 2 });
        b.emit_branch(|target| I::Leave { target }, after);
        b.place(after);
        b.emit(I::Ret { src: r });
        b.add_clause(Handler::Catch(thrown), (try_start, handler), (handler, after));
        Ok(())
    });
    let (rt, mut interp) = h.seal();
    assert_eq!(interp.call(outer, &[]).unwrap().as_i32(), 2);
    // counted where it was thrown, not again in the caller
    assert_eq!(rt.metrics().snapshot().exceptions_raised, 1);
}

#[test]
fn engine_exceptions_match_base_classes() {
    let mut h = TestHarness::new();
    let arithmetic = h.rt.exception_class(ExceptionKind::Arithmetic);
    let m = h.method("Div", &[TypeDesc::I4], TypeDesc::I4);
    h.body(m, &[TypeDesc::I4], |b| {
        let n = b.arg(0)?;
        let r = b.local(0)?;
        let k = b.eval(0);
        let (handler, after) = (b.new_label(), b.new_label());
        let try_start = b.here();
        b.emit(I::LdcI4 { dst: k, value: 10 });
        b.emit(I::DivI4 { dst: r, a: k, b: n });
        b.emit_branch(|target| I::Leave { target }, after);
        b.place(handler);
        b.emit(I::LdcI4 { dst: r, value: -1 });
        b.emit_branch(|target| I::Leave { target }, after);
        b.place(after);
        b.emit(I::Ret { src: r });
        b.add_clause(Handler::Catch(arithmetic), (try_start, handler), (handler, after));
        Ok(())
    });
    let (_, mut interp) = h.seal();
    assert_eq!(interp.call(m, &[StackObject::from_i32(5)]).unwrap().as_i32(), 2);
    assert_eq!(interp.call(m, &[StackObject::from_i32(0)]).unwrap().as_i32(), -1);
}

/// `try { try { throw First } finally { throw Second } } catch (C) { }`
/// where `C` is `First` or `System.Exception`. The catch logs whether it holds
/// a `Second`.
fn throw_from_finally(catch_first_only: bool) -> (Arc<Runtime>, Result<StackObject, ExecuteError>, Vec<i32>) {
    let mut h = TestHarness::new();
    let (log_m, recorded) = h.recorder();
    let first = h.exception_class("First");
    let second = h.exception_class("Second");
    let caught = if catch_first_only { first } else { h.rt.exception_base() };
    let m = h.method("Run", &[], TypeDesc::I4);
    h.body(m, &[], |b| {
        let (e, r) = (b.eval(0), b.eval(1));
        let (finally_start, catch_start, after) = (b.new_label(), b.new_label(), b.new_label());
        let outer_try = b.here();
        let inner_try = b.here();
        log(b, log_m, 1);
        b.emit(I::NewObjNoCtor { dst: e, class: first });
        b.emit(I::Throw { ex: e });
        b.place(finally_start);
        log(b, log_m, 2);
        b.emit(I::NewObjNoCtor { dst: e, class: second });
        b.emit(I::Throw { ex: e });
        b.emit(I::EndFinally {});
        b.place(catch_start);
        let ex = b.exception_slot();
        b.emit(I::IsInst {
            dst: e,
            obj: ex,
            class: second,
        });
        b.emit(I::Ldnull { dst: r });
        b.emit(I::CgtUnI8 { dst: r, a: e, b: r });
        b.emit(I::CallNativeVoid { method: log_m, arg_base: r });
        b.emit_branch(|target| I::Leave { target }, after);
        b.place(after);
        b.emit(I::LdcI4 { dst: r, value: 42 });
        b.emit(I::Ret { src: r });

        b.add_clause(Handler::Finally, (inner_try, finally_start), (finally_start, catch_start));
        b.add_clause(Handler::Catch(caught), (outer_try, catch_start), (catch_start, after));
        Ok(())
    });
    let (rt, mut interp) = h.seal();
    let result = interp.call(m, &[]);
    assert!(interp.machine().frames().is_empty());
    let recorded = recorded.lock().clone();
    (rt, result, recorded)
}

#[test]
fn exception_from_finally_is_caught_in_the_same_frame() {
    let (rt, result, recorded) = throw_from_finally(false);
    assert_eq!(result.unwrap().as_i32(), 42);
    assert_eq!(recorded, vec![1, 2, 1]);
    assert_eq!(rt.metrics().snapshot().exceptions_raised, 2);
}

#[test]
fn exception_from_finally_replaces_the_one_in_flight() {
    let (rt, result, recorded) = throw_from_finally(true);
    assert_eq!(unhandled_class(&rt, result), "Second");
    assert_eq!(recorded, vec![1, 2]);
}

/// `try { throw new E(code) } filter (code == 1) { return 5 }`, with the
/// code stored on the exception.
fn filtered(accept: i32) -> (Arc<Runtime>, Result<StackObject, ExecuteError>) {
    let mut h = TestHarness::new();
    let thrown = h.exception_class("CodedError");
    let m = h.method("Filtered", &[TypeDesc::I4], TypeDesc::I4);
    h.body(m, &[], |b| {
        let code = b.arg(0)?;
        let (e, t, one) = (b.eval(0), b.eval(1), b.eval(2));
        let (filter, handler, after) = (b.new_label(), b.new_label(), b.new_label());
        let try_start = b.here();
        b.emit(I::NewObjNoCtor { dst: e, class: thrown });
        b.emit(I::Throw { ex: e });
        b.place(filter);
        b.emit(I::LdcI4 { dst: one, value: 1 });
        b.emit(I::CeqI4 { dst: t, a: code, b: one });
        b.emit(I::EndFilter { value: t });
        b.place(handler);
        b.emit(I::LdcI4 { dst: t, value: 5 });
        b.emit_branch(|target| I::Leave { target }, after);
        b.place(after);
        b.emit(I::Ret { src: t });
        b.add_clause(Handler::Filter(filter), (try_start, filter), (handler, after));
        Ok(())
    });
    let (rt, mut interp) = h.seal();
    let r = interp.call(m, &[StackObject::from_i32(accept)]);
    (rt, r)
}

#[test]
fn filter_decides_whether_its_handler_runs() {
    let (_, accepted) = filtered(1);
    assert_eq!(accepted.unwrap().as_i32(), 5);
    let (rt, rejected) = filtered(0);
    assert_eq!(unhandled_class(&rt, rejected), "CodedError");
}

#[test]
fn rethrow_propagates_the_caught_exception() {
    let mut h = TestHarness::new();
    let (log_m, recorded) = h.recorder();
    let thrown = h.exception_class("E");
    let m = h.method("Rethrow", &[], TypeDesc::Void);
    h.body(m, &[], |b| {
        let e = b.eval(0);
        let (handler, end) = (b.new_label(), b.new_label());
        let try_start = b.here();
        b.emit(I::NewObjNoCtor { dst: e, class: thrown });
        b.emit(I::Throw { ex: e });
        b.place(handler);
        log(b, log_m, 1);
        b.emit(I::Rethrow {});
        b.place(end);
        b.add_clause(Handler::Catch(thrown), (try_start, handler), (handler, end));
        Ok(())
    });
    let (rt, mut interp) = h.seal();
    assert_eq!(unhandled_class(&rt, interp.call(m, &[])), "E");
    assert_eq!(*recorded.lock(), vec![1]);
}

#[test]
fn fault_handler_runs_only_on_exception() {
    let mut h = TestHarness::new();
    let (log_m, recorded) = h.recorder();
    let m = h.method("Faulty", &[TypeDesc::I4], TypeDesc::Void);
    h.body(m, &[], |b| {
        let fail = b.arg(0)?;
        let e = b.eval(0);
        let (done, handler, end) = (b.new_label(), b.new_label(), b.new_label());
        let try_start = b.here();
        b.emit_branch(|target| I::BrFalseI4 { cond: fail, target }, done);
        b.emit(I::Ldnull { dst: e });
        b.emit(I::Throw { ex: e });
        b.place(done);
        b.emit_branch(|target| I::Leave { target }, end);
        b.place(handler);
        log(b, log_m, 9);
        b.emit(I::EndFinally {});
        b.place(end);
        b.emit(I::RetVoid {});
        b.add_clause(Handler::Fault, (try_start, handler), (handler, end));
        Ok(())
    });
    let (rt, mut interp) = h.seal();
    interp.call(m, &[StackObject::from_i32(0)]).unwrap();
    assert!(recorded.lock().is_empty());
    let r = interp.call(m, &[StackObject::from_i32(1)]);
    // throwing null raises NullReferenceException instead
    assert_eq!(unhandled_class(&rt, r), "System.NullReferenceException");
    assert_eq!(*recorded.lock(), vec![9]);
}

#[test]
fn stack_trace_lists_interpreted_frames_innermost_first() {
    let mut h = TestHarness::new();
    let inner = h.method("Inner", &[], TypeDesc::Void);
    let outer = h.method("Outer", &[], TypeDesc::Void);
    h.body(inner, &[], |b| {
        let (a, z) = (b.eval(0), b.eval(1));
        b.emit(I::LdcI4 { dst: a, value: 1 });
        b.emit(I::LdcI4 { dst: z, value: 0 });
        b.emit(I::RemI4 { dst: a, a, b: z });
        b.emit(I::RetVoid {});
        Ok(())
    });
    h.body(outer, &[], |b| {
        let args = b.eval(0);
        b.emit(I::Nop {});
        b.emit(I::CallInterpVoid {
            method: inner,
            arg_base: args,
        });
        b.emit(I::RetVoid {});
        Ok(())
    });
    let (rt, mut interp) = h.seal();
    let Err(ExecuteError::Unhandled(ex)) = interp.call(outer, &[]) else {
        panic!("expected DivideByZeroException");
    };
    let trace = rt.stack_trace(ex);
    let names: Vec<_> = trace.iter().map(|f| f.method.as_str()).collect();
    assert_eq!(names, ["Tests::Inner", "Tests::Outer"]);
    // offsets: the faulting rem, and the call after the 2-byte nop
    assert_eq!(trace[0].offset, 16);
    assert_eq!(trace[1].offset, 2);
    assert_eq!(
        rt.describe_exception(ex),
        "System.DivideByZeroException: Attempted to divide by zero."
    );
}

#[test]
fn failing_static_constructor_poisons_the_class() {
    let mut h = TestHarness::new();
    let settings = h.rt.define_class(ClassDef::class("Settings")).unwrap();
    let cctor = h.rt.define_method(MethodDef::new(settings, ".cctor")).unwrap();
    let get = h
        .rt
        .define_method(MethodDef::new(settings, "Get").returns(TypeDesc::I4))
        .unwrap();
    h.rt.set_cctor(settings, cctor).unwrap();
    h.body(cctor, &[], |b| {
        let (a, z) = (b.eval(0), b.eval(1));
        b.emit(I::LdcI4 { dst: a, value: 1 });
        b.emit(I::LdcI4 { dst: z, value: 0 });
        b.emit(I::DivI4 { dst: a, a, b: z });
        b.emit(I::RetVoid {});
        Ok(())
    });
    h.body(get, &[], |b| {
        let r = b.eval(0);
        b.emit(I::LdcI4 { dst: r, value: 3 });
        b.emit(I::Ret { src: r });
        Ok(())
    });
    let (rt, mut interp) = h.seal();
    let Err(ExecuteError::Unhandled(first)) = interp.call(get, &[]) else {
        panic!("expected TypeInitializationException");
    };
    assert_eq!(
        rt.describe_exception(first),
        "System.TypeInitializationException: The type initializer for 'Settings' threw an \
         exception: Attempted to divide by zero."
    );
    let Err(ExecuteError::Unhandled(second)) = interp.call(get, &[]) else {
        panic!("expected the same exception again");
    };
    assert_eq!(first, second);
    assert_eq!(rt.metrics().snapshot().class_inits, 0);
}
