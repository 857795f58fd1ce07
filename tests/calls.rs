mod common;

use common::{i32s, unhandled_class, TestHarness};
use hybrid_interp::{
    runtime::exceptions::ExceptionKind,
    types::{ClassDef, ClassHandle, MethodDef, MethodHandle, TypeDesc},
    value::{Address, StackObject},
    vm::{
        abi::{self, LocationKind, TargetAbi},
        error::Fault,
        opcodes::Instruction as I,
        Interpreter,
    },
};

fn offset_of(h: &TestHarness, class: ClassHandle, field: &str) -> u32 {
    h.rt.class(class).unwrap().field(field).unwrap().offset
}

#[test]
fn interface_call_reaches_interpreted_override_of_native_base() {
    let mut h = TestHarness::new();
    let shape = h.rt.define_class(ClassDef::interface("IShape")).unwrap();
    let area = h
        .rt
        .define_method(MethodDef::new(shape, "Area").returns(TypeDesc::I4))
        .unwrap();
    let base = h
        .rt
        .define_class(ClassDef::class("ShapeBase").implements(shape))
        .unwrap();
    h.rt.define_method(
        MethodDef::new(base, "Area")
            .virtual_method()
            .returns(TypeDesc::I4)
            .native(|_, _, ret| {
                ret[0] = StackObject::from_i32(-1);
                Ok(())
            }),
    )
    .unwrap();
    let rect = h
        .rt
        .define_class(
            ClassDef::class("Rect")
                .extends(base)
                .field("w", TypeDesc::I4)
                .field("h", TypeDesc::I4),
        )
        .unwrap();
    let (w, ht) = (offset_of(&h, rect, "w"), offset_of(&h, rect, "h"));
    let rect_area = h
        .rt
        .define_method(MethodDef::new(rect, "Area").virtual_method().returns(TypeDesc::I4))
        .unwrap();
    h.body(rect_area, &[], |b| {
        let this = b.arg(0)?;
        let (x, y) = (b.eval(0), b.eval(1));
        b.emit(I::LdfldI4 { dst: x, obj: this, offset: w });
        b.emit(I::LdfldI4 { dst: y, obj: this, offset: ht });
        b.emit(I::MulI4 { dst: x, a: x, b: y });
        b.emit(I::Ret { src: x });
        Ok(())
    });

    // Measure(bool derived) => (derived ? new Rect(3, 5) : new ShapeBase()).Area()
    let measure = h.method("Measure", &[TypeDesc::I4], TypeDesc::I4);
    h.body(measure, &[], |b| {
        let derived = b.arg(0)?;
        let (obj, k, ret) = (b.eval(0), b.eval(1), b.eval(2));
        let (make_base, call) = (b.new_label(), b.new_label());
        b.emit_branch(|target| I::BrFalseI4 { cond: derived, target }, make_base);
        b.emit(I::NewObjNoCtor { dst: obj, class: rect });
        b.emit(I::LdcI4 { dst: k, value: 3 });
        b.emit(I::StfldI4 { obj, offset: w, src: k });
        b.emit(I::LdcI4 { dst: k, value: 5 });
        b.emit(I::StfldI4 { obj, offset: ht, src: k });
        b.emit_branch(|target| I::Br { target }, call);
        b.place(make_base);
        b.emit(I::NewObjNoCtor { dst: obj, class: base });
        b.place(call);
        b.emit(I::CallVirtualRet {
            method: area,
            arg_base: obj,
            ret,
        });
        b.emit(I::Ret { src: ret });
        Ok(())
    });

    let (rt, mut interp) = h.seal();
    assert_eq!(interp.call(measure, &i32s(&[1])).unwrap().as_i32(), 15);
    assert_eq!(interp.call(measure, &i32s(&[0])).unwrap().as_i32(), -1);
    assert_eq!(rt.metrics().snapshot().native_calls, 1);
}

#[test]
fn virtual_call_on_null_raises() {
    let mut h = TestHarness::new();
    let base = h.rt.define_class(ClassDef::class("Base")).unwrap();
    let get = h
        .rt
        .define_method(MethodDef::new(base, "Get").virtual_method().returns(TypeDesc::I4))
        .unwrap();
    let m = h.method("CallOnNull", &[], TypeDesc::I4);
    h.body(m, &[], |b| {
        let (obj, ret) = (b.eval(0), b.eval(1));
        b.emit(I::Ldnull { dst: obj });
        b.emit(I::CallVirtualRet { method: get, arg_base: obj, ret });
        b.emit(I::Ret { src: ret });
        Ok(())
    });
    let (rt, mut interp) = h.seal();
    assert_eq!(unhandled_class(&rt, interp.call(m, &[])), "System.NullReferenceException");
}

#[test]
fn native_method_can_reenter_the_interpreter() {
    let mut h = TestHarness::new();
    let double = h.method("Double", &[TypeDesc::I4], TypeDesc::I4);
    h.body(double, &[], |b| {
        let x = b.arg(0)?;
        let t = b.eval(0);
        b.emit(I::AddI4 { dst: t, a: x, b: x });
        b.emit(I::Ret { src: t });
        Ok(())
    });
    let quadruple = h.native("Quadruple", &[TypeDesc::I4], TypeDesc::I4, move |interp, args, ret| {
        let once = interp.call(double, &args[..1])?;
        ret[0] = interp.call(double, &[once])?;
        Ok(())
    });
    let m = h.method("Run", &[TypeDesc::I4], TypeDesc::I4);
    h.body(m, &[], |b| {
        let x = b.arg(0)?;
        let (arg, ret) = (b.eval(0), b.eval(1));
        b.emit(I::Mov4 { dst: arg, src: x });
        b.emit(I::CallNativeRet {
            method: quadruple,
            arg_base: arg,
            ret,
        });
        b.emit(I::AddI4 { dst: ret, a: ret, b: x });
        b.emit(I::Ret { src: ret });
        Ok(())
    });
    let (_, mut interp) = h.seal();
    assert_eq!(interp.call(m, &i32s(&[7])).unwrap().as_i32(), 35);
    assert!(interp.machine().frames().is_empty());
}

#[test]
fn calli_through_ldftn_and_ldvirtftn() {
    let mut h = TestHarness::new();
    let animal = h.rt.define_class(ClassDef::class("Animal")).unwrap();
    let legs = h
        .rt
        .define_method(
            MethodDef::new(animal, "Legs")
                .virtual_method()
                .returns(TypeDesc::I4)
                .native(|_, _, ret| {
                    ret[0] = StackObject::from_i32(4);
                    Ok(())
                }),
        )
        .unwrap();
    let bird = h.rt.define_class(ClassDef::class("Bird").extends(animal)).unwrap();
    let bird_legs = h
        .rt
        .define_method(MethodDef::new(bird, "Legs").virtual_method().returns(TypeDesc::I4))
        .unwrap();
    h.body(bird_legs, &[], |b| {
        let t = b.eval(0);
        b.emit(I::LdcI4 { dst: t, value: 2 });
        b.emit(I::Ret { src: t });
        Ok(())
    });
    let negate = h.method("Negate", &[TypeDesc::I4], TypeDesc::I4);
    h.body(negate, &[], |b| {
        let x = b.arg(0)?;
        let t = b.eval(0);
        b.emit(I::NegI4 { dst: t, src: x });
        b.emit(I::Ret { src: t });
        Ok(())
    });

    // -(bird.Legs) + 100 * negate(-1), both through function pointers
    let m = h.method("Run", &[], TypeDesc::I4);
    h.body(m, &[], |b| {
        // call arguments go last so callee frames never cover live temporaries
        let (f, obj, r1, r2, k, arg) = (b.eval(0), b.eval(1), b.eval(2), b.eval(3), b.eval(4), b.eval(5));
        b.emit(I::NewObjNoCtor { dst: obj, class: bird });
        b.emit(I::Ldvirtftn { dst: f, obj, method: legs });
        b.emit(I::Mov8 { dst: arg, src: obj });
        b.emit(I::CallIndRet { fnptr: f, arg_base: arg, ret: r1 });
        b.emit(I::NegI4 { dst: r1, src: r1 });
        b.emit(I::Ldftn { dst: f, method: negate });
        b.emit(I::LdcI4 { dst: arg, value: -1 });
        b.emit(I::CallIndRet { fnptr: f, arg_base: arg, ret: r2 });
        b.emit(I::LdcI4 { dst: k, value: 100 });
        b.emit(I::MulI4 { dst: r2, a: r2, b: k });
        b.emit(I::AddI4 { dst: r1, a: r1, b: r2 });
        b.emit(I::Ret { src: r1 });
        Ok(())
    });
    let (_, mut interp) = h.seal();
    assert_eq!(interp.call(m, &[]).unwrap().as_i32(), 98);
}

#[test]
fn calli_through_null_pointer_raises() {
    let mut h = TestHarness::new();
    let m = h.method("Run", &[], TypeDesc::Void);
    h.body(m, &[], |b| {
        let (f, arg) = (b.eval(0), b.eval(1));
        b.emit(I::Ldnull { dst: f });
        b.emit(I::CallIndVoid { fnptr: f, arg_base: arg });
        b.emit(I::RetVoid {});
        Ok(())
    });
    let (rt, mut interp) = h.seal();
    assert_eq!(unhandled_class(&rt, interp.call(m, &[])), "System.NullReferenceException");
}

/// `.ctor(int, int)` storing its arguments into two `int` fields of `this`.
fn two_field_ctor(h: &mut TestHarness, class: ClassHandle, first: u32, second: u32) -> MethodHandle {
    let m = h
        .rt
        .define_method(
            MethodDef::new(class, ".ctor")
                .constructor()
                .params([TypeDesc::I4, TypeDesc::I4]),
        )
        .unwrap();
    h.body(m, &[], |b| {
        let (this, x, y) = (b.arg(0)?, b.arg(1)?, b.arg(2)?);
        b.emit(I::StfldI4 { obj: this, offset: first, src: x });
        b.emit(I::StfldI4 { obj: this, offset: second, src: y });
        b.emit(I::RetVoid {});
        Ok(())
    });
    m
}

#[test]
fn constructors_for_objects_and_value_types() {
    let mut h = TestHarness::new();
    let point = h
        .rt
        .define_class(
            ClassDef::class("Point")
                .field("x", TypeDesc::I4)
                .field("y", TypeDesc::I4),
        )
        .unwrap();
    let pair = h
        .rt
        .define_class(
            ClassDef::value_type("Pair")
                .field("a", TypeDesc::I4)
                .field("b", TypeDesc::I4),
        )
        .unwrap();
    let (px, py) = (offset_of(&h, point, "x"), offset_of(&h, point, "y"));
    let (pa, pb) = (offset_of(&h, pair, "a"), offset_of(&h, pair, "b"));
    let point_ctor = two_field_ctor(&mut h, point, px, py);
    let pair_ctor = two_field_ctor(&mut h, pair, pa, pb);

    // new Point(3, 4).x * 10 + new Pair(5, 6).b
    let m = h.method("Run", &[], TypeDesc::I4);
    h.body(m, &[TypeDesc::Value(pair)], |b| {
        let value = b.local(0)?;
        let (r, obj, this, x, y) = (b.eval(0), b.eval(1), b.eval(2), b.eval(3), b.eval(4));
        b.emit(I::LdcI4 { dst: x, value: 3 });
        b.emit(I::LdcI4 { dst: y, value: 4 });
        b.emit(I::NewObjInterp {
            dst: obj,
            method: point_ctor,
            arg_base: this,
        });
        b.emit(I::LdfldI4 { dst: r, obj, offset: px });
        b.emit(I::LdcI4 { dst: x, value: 10 });
        b.emit(I::MulI4 { dst: r, a: r, b: x });
        b.emit(I::LdcI4 { dst: x, value: 5 });
        b.emit(I::LdcI4 { dst: y, value: 6 });
        b.emit(I::NewValueTypeInterp {
            dst: value,
            method: pair_ctor,
            arg_base: this,
        });
        b.emit(I::LdvfldI4 { dst: x, src: value, offset: pb });
        b.emit(I::AddI4 { dst: r, a: r, b: x });
        b.emit(I::Ret { src: r });
        Ok(())
    });
    let (_, mut interp) = h.seal();
    assert_eq!(interp.call(m, &[]).unwrap().as_i32(), 36);
}

#[test]
fn static_constructor_runs_once_before_first_access() {
    let mut h = TestHarness::new();
    let (log_m, recorded) = h.recorder();
    let counter = h
        .rt
        .define_class(ClassDef::class("Counter").static_field("count", TypeDesc::I4))
        .unwrap();
    let count = offset_of(&h, counter, "count");
    let cctor = h.rt.define_method(MethodDef::new(counter, ".cctor")).unwrap();
    let next = h
        .rt
        .define_method(MethodDef::new(counter, "Next").returns(TypeDesc::I4))
        .unwrap();
    h.rt.set_cctor(counter, cctor).unwrap();
    h.body(cctor, &[], |b| {
        let t = b.eval(0);
        b.emit(I::LdcI4 { dst: t, value: 100 });
        b.emit(I::StsfldI4 { class: counter, offset: count, src: t });
        b.emit(I::LdcI4 { dst: t, value: 5 });
        b.emit(I::CallNativeVoid { method: log_m, arg_base: t });
        b.emit(I::RetVoid {});
        Ok(())
    });
    h.body(next, &[], |b| {
        let (t, one) = (b.eval(0), b.eval(1));
        b.emit(I::LdsfldI4 { dst: t, class: counter, offset: count });
        b.emit(I::LdcI4 { dst: one, value: 1 });
        b.emit(I::AddI4 { dst: t, a: t, b: one });
        b.emit(I::StsfldI4 { class: counter, offset: count, src: t });
        b.emit(I::Ret { src: t });
        Ok(())
    });
    let m = h.method("Run", &[], TypeDesc::I4);
    h.body(m, &[], |b| {
        let (r1, r2, a) = (b.eval(0), b.eval(1), b.eval(2));
        b.emit(I::CallInterpRet { method: next, arg_base: a, ret: r1 });
        b.emit(I::CallInterpRet { method: next, arg_base: a, ret: r2 });
        b.emit(I::AddI4 { dst: r1, a: r1, b: r2 });
        b.emit(I::Ret { src: r1 });
        Ok(())
    });
    let (rt, mut interp) = h.seal();
    assert_eq!(interp.call(m, &[]).unwrap().as_i32(), 101 + 102);
    assert_eq!(interp.call(next, &[]).unwrap().as_i32(), 103);
    assert_eq!(*recorded.lock(), vec![5]);
    // Tests and Counter
    assert_eq!(rt.metrics().snapshot().class_inits, 2);
}

/// A static `Invoke(IntFunc d, int x) => d(x)` on the harness class.
fn delegate_invoker(h: &mut TestHarness, func: ClassHandle) -> MethodHandle {
    let m = h.method("Invoke", &[TypeDesc::Object(func), TypeDesc::I4], TypeDesc::I4);
    h.body(m, &[], |b| {
        let (d, x) = (b.arg(0)?, b.arg(1)?);
        let (base, arg, ret) = (b.eval(0), b.eval(1), b.eval(2));
        b.emit(I::Mov8 { dst: base, src: d });
        b.emit(I::Mov4 { dst: arg, src: x });
        b.emit(I::CallDelegateRet { arg_base: base, ret });
        b.emit(I::Ret { src: ret });
        Ok(())
    });
    m
}

#[test]
fn closed_instance_delegate_binds_its_target() {
    let mut h = TestHarness::new();
    let func = h.rt.define_class(ClassDef::delegate("IntFunc")).unwrap();
    let adder = h
        .rt
        .define_class(ClassDef::class("Adder").field("k", TypeDesc::I4))
        .unwrap();
    let k = offset_of(&h, adder, "k");
    let add = h
        .rt
        .define_method(
            MethodDef::new(adder, "Add")
                .instance()
                .params([TypeDesc::I4])
                .returns(TypeDesc::I4),
        )
        .unwrap();
    h.body(add, &[], |b| {
        let (this, x) = (b.arg(0)?, b.arg(1)?);
        let t = b.eval(0);
        b.emit(I::LdfldI4 { dst: t, obj: this, offset: k });
        b.emit(I::AddI4 { dst: t, a: t, b: x });
        b.emit(I::Ret { src: t });
        Ok(())
    });
    let invoke = delegate_invoker(&mut h, func);
    let (rt, mut interp) = h.seal();

    let target = rt.alloc_instance(adder).unwrap();
    rt.write_field::<i32>(target, k, 40).unwrap();
    let bound = rt.new_delegate(func, Some(target), add).unwrap();
    let args = [StackObject::from_ref(Some(bound)), StackObject::from_i32(2)];
    assert_eq!(interp.call(invoke, &args).unwrap().as_i32(), 42);

    let unbound = rt.new_delegate(func, None, add).unwrap();
    let args = [StackObject::from_ref(Some(unbound)), StackObject::from_i32(2)];
    assert_eq!(unhandled_class(&rt, interp.call(invoke, &args)), "System.NullReferenceException");
}

#[test]
fn multicast_delegate_runs_every_target_and_keeps_the_last_result() {
    let mut h = TestHarness::new();
    let (log_m, recorded) = h.recorder();
    let func = h.rt.define_class(ClassDef::delegate("IntFunc")).unwrap();
    let sink = recorded.clone();
    let add_one = h.native("AddOne", &[TypeDesc::I4], TypeDesc::I4, move |_, args, ret| {
        sink.lock().push(1);
        ret[0] = StackObject::from_i32(args[0].as_i32() + 1);
        Ok(())
    });
    let times_ten = h.method("TimesTen", &[TypeDesc::I4], TypeDesc::I4);
    h.body(times_ten, &[], |b| {
        let x = b.arg(0)?;
        let (t, k) = (b.eval(0), b.eval(1));
        b.emit(I::LdcI4 { dst: t, value: 2 });
        b.emit(I::CallNativeVoid { method: log_m, arg_base: t });
        b.emit(I::LdcI4 { dst: k, value: 10 });
        b.emit(I::MulI4 { dst: t, a: x, b: k });
        b.emit(I::Ret { src: t });
        Ok(())
    });
    let boom = h.native("Boom", &[TypeDesc::I4], TypeDesc::I4, |interp: &mut Interpreter, _, _| {
        Err(Fault::Managed(
            interp.runtime().new_exception(ExceptionKind::InvalidCast, None),
        ))
    });
    let invoke = delegate_invoker(&mut h, func);
    let (rt, mut interp) = h.seal();

    let d1 = rt.new_delegate(func, None, add_one).unwrap();
    let d2 = rt.new_delegate(func, None, times_ten).unwrap();
    let both = rt.combine_delegates(Some(d1), Some(d2)).unwrap();
    let args = [StackObject::from_ref(both), StackObject::from_i32(4)];
    assert_eq!(interp.call(invoke, &args).unwrap().as_i32(), 40);
    assert_eq!(*recorded.lock(), vec![1, 2]);

    recorded.lock().clear();
    let d3 = rt.new_delegate(func, None, boom).unwrap();
    let failing = rt.combine_delegates(Some(d1), Some(d3)).unwrap();
    let failing = rt.combine_delegates(failing, Some(d2)).unwrap();
    let args = [StackObject::from_ref(failing), StackObject::from_i32(4)];
    assert_eq!(unhandled_class(&rt, interp.call(invoke, &args)), "System.InvalidCastException");
    assert_eq!(*recorded.lock(), vec![1]);
}

/// Weighted byte sum used to check struct contents survive a call intact.
fn weighted(bytes: &[u8]) -> i32 {
    bytes.iter().enumerate().map(|(i, &b)| (i as i32 + 1) * b as i32).sum()
}

fn pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 37 + 11) as u8).collect()
}

/// Builds a `size`-byte struct field by field, passes it by value to
/// `WeightedSum` and returns what the callee computed.
fn pass_struct(size: usize, native_callee: bool) -> i32 {
    let mut h = TestHarness::new();
    let mut def = ClassDef::value_type(format!("Blob{size}"));
    for i in 0..size {
        def = def.field(format!("b{i}"), TypeDesc::U1);
    }
    let blob = h.rt.define_class(def).unwrap();
    assert_eq!(h.rt.type_size(TypeDesc::Value(blob)).unwrap(), size as u32);

    let callee = if native_callee {
        h.native(
            "WeightedSum",
            &[TypeDesc::Value(blob)],
            TypeDesc::I4,
            move |interp, args, ret| {
                let rt = interp.runtime().clone();
                let desc = abi::describe_type(&rt, TargetAbi::host(), TypeDesc::Value(blob)).unwrap();
                let bytes = match desc.kind {
                    LocationKind::Indirect(n) => match args[0].as_address().unwrap() {
                        Some(Address::Stack(at)) => interp.machine().bytes(at, n as usize).unwrap().to_vec(),
                        other => panic!("unexpected struct address {other:?}"),
                    },
                    _ => args.iter().flat_map(|s| s.0.to_le_bytes()).take(size).collect(),
                };
                ret[0] = StackObject::from_i32(weighted(&bytes));
                Ok(())
            },
        )
    } else {
        let m = h.method("WeightedSum", &[TypeDesc::Value(blob)], TypeDesc::I4);
        h.body(m, &[], |b| {
            let s = b.arg(0)?;
            let (acc, t, w) = (b.eval(0), b.eval(1), b.eval(2));
            b.emit(I::LdcI4 { dst: acc, value: 0 });
            for i in 0..size {
                b.emit(I::LdvfldU1 {
                    dst: t,
                    src: s,
                    offset: i as u32,
                });
                b.emit(I::LdcI4 {
                    dst: w,
                    value: i as i32 + 1,
                });
                b.emit(I::MulI4 { dst: t, a: t, b: w });
                b.emit(I::AddI4 { dst: acc, a: acc, b: t });
            }
            b.emit(I::Ret { src: acc });
            Ok(())
        });
        m
    };

    let bytes = pattern(size);
    let m = h.method("Run", &[], TypeDesc::I4);
    h.body(m, &[TypeDesc::Value(blob)], |b| {
        let local = b.local(0)?;
        let (ret, p, t) = (b.eval(0), b.eval(1), b.eval(2));
        b.emit(I::LdlocAddr { dst: p, src: local });
        for (i, &v) in bytes.iter().enumerate() {
            b.emit(I::LdcI4 { dst: t, value: v as i32 });
            b.emit(I::StfldI1 {
                obj: p,
                offset: i as u32,
                src: t,
            });
        }
        let arg = b.eval(3);
        b.reserve_eval(3, size.div_ceil(8) as u16);
        b.emit(I::MovN {
            dst: arg,
            src: local,
            size: size as u16,
        });
        if native_callee {
            b.emit(I::CallNativeRet { method: callee, arg_base: arg, ret });
        } else {
            b.emit(I::CallInterpRet { method: callee, arg_base: arg, ret });
        }
        b.emit(I::Ret { src: ret });
        Ok(())
    });
    let (_, mut interp) = h.seal();
    interp.call(m, &[]).unwrap().as_i32()
}

#[test]
fn structs_of_every_size_band_pass_by_value() {
    for size in [1, 2, 3, 4, 8, 12, 16, 17, 20, 24, 28, 32, 40] {
        let expected = weighted(&pattern(size));
        assert_eq!(pass_struct(size, false), expected, "interpreted callee, {size} bytes");
        assert_eq!(pass_struct(size, true), expected, "native callee, {size} bytes");
    }
}
