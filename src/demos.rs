//! Sample programs for the command line, assembled with the bytecode builder.
//!
//! Every demo defines its classes on a fresh [`Runtime`] and exposes a static
//! entry point taking one `int`.
use crate::{
    runtime::{exceptions::ExceptionKind, Runtime},
    types::{ClassDef, ClassHandle, MethodDef, MethodHandle, TypeDesc},
    value::StackObject,
    vm::{
        builder::{Handler, InterpMethodBuilder},
        error::{TypeResolutionError, VmError},
        opcodes::Instruction as I,
    },
};

pub struct Program {
    pub entry: MethodHandle,
    /// Every interpreted body the demo installed, entry first.
    pub bodies: Vec<MethodHandle>,
}

pub struct Demo {
    pub name: &'static str,
    pub about: &'static str,
    pub default_arg: i32,
    build: fn(&mut Runtime) -> Result<Program, VmError>,
}

impl Demo {
    pub fn build(&self, rt: &mut Runtime) -> Result<Program, VmError> {
        (self.build)(rt)
    }
}

pub const DEMOS: &[Demo] = &[
    Demo {
        name: "factorial",
        about: "recursive n! with checked multiplication (overflows past 12)",
        default_arg: 10,
        build: factorial,
    },
    Demo {
        name: "fib",
        about: "iterative Fibonacci over 64-bit locals",
        default_arg: 50,
        build: fib,
    },
    Demo {
        name: "sum-squares",
        about: "fills an int[n] with squares and sums it",
        default_arg: 100,
        build: sum_squares,
    },
    Demo {
        name: "guarded-divide",
        about: "1000 / n inside try/catch/finally; n = 0 yields -1",
        default_arg: 7,
        build: guarded_divide,
    },
    Demo {
        name: "delegate",
        about: "invokes a static delegate that squares its argument",
        default_arg: 12,
        build: delegate,
    },
    Demo {
        name: "virtual",
        about: "interface call reaching an interpreted override of a native base",
        default_arg: 9,
        build: virtual_dispatch,
    },
];

pub fn find(name: &str) -> Option<&'static Demo> {
    DEMOS.iter().find(|d| d.name == name)
}

fn install(rt: &mut Runtime, b: InterpMethodBuilder, program: &mut Vec<MethodHandle>) -> Result<(), VmError> {
    let info = b.finish()?;
    program.push(info.method);
    rt.set_interp_body(info.method, info)
}

fn field_offset(rt: &Runtime, class: ClassHandle, name: &str) -> Result<u32, VmError> {
    rt.class(class)?
        .field(name)
        .map(|f| f.offset)
        .ok_or_else(|| TypeResolutionError::InvalidClass(class.0).into())
}

fn factorial(rt: &mut Runtime) -> Result<Program, VmError> {
    let c = rt.define_class(ClassDef::class("Demo.Factorial"))?;
    let fact = rt.define_method(MethodDef::new(c, "Fact").params([TypeDesc::I4]).returns(TypeDesc::I4))?;

    let mut b = InterpMethodBuilder::new(rt, fact, &[])?;
    let n = b.arg(0)?;
    let one = b.eval(0);
    let t = b.eval(1);
    let recurse = b.new_label();
    b.emit(I::LdcI4 { dst: one, value: 1 });
    b.emit_branch(|target| I::BgtI4 { a: n, b: one, target }, recurse);
    b.emit(I::Ret { src: one });
    b.place(recurse);
    b.emit(I::SubI4 { dst: t, a: n, b: one });
    b.emit(I::CallInterpRet {
        method: fact,
        arg_base: t,
        ret: t,
    });
    b.emit(I::MulOvfI4 { dst: t, a: n, b: t });
    b.emit(I::Ret { src: t });

    let mut bodies = vec![];
    install(rt, b, &mut bodies)?;
    Ok(Program { entry: fact, bodies })
}

fn fib(rt: &mut Runtime) -> Result<Program, VmError> {
    let c = rt.define_class(ClassDef::class("Demo.Fib"))?;
    let m = rt.define_method(MethodDef::new(c, "Fib").params([TypeDesc::I4]).returns(TypeDesc::I8))?;

    let mut b = InterpMethodBuilder::new(rt, m, &[TypeDesc::I8, TypeDesc::I8, TypeDesc::I4])?;
    let n = b.arg(0)?;
    let (prev, cur, i) = (b.local(0)?, b.local(1)?, b.local(2)?);
    let (sum, one) = (b.eval(0), b.eval(1));
    let (head, done) = (b.new_label(), b.new_label());
    b.emit(I::LdcI8 { dst: cur, value: 1 });
    b.emit(I::LdcI4 { dst: one, value: 1 });
    b.place(head);
    b.emit_branch(|target| I::BgeI4 { a: i, b: n, target }, done);
    b.emit(I::AddI8 { dst: sum, a: prev, b: cur });
    b.emit(I::Mov8 { dst: prev, src: cur });
    b.emit(I::Mov8 { dst: cur, src: sum });
    b.emit(I::AddI4 { dst: i, a: i, b: one });
    b.emit_branch(|target| I::Br { target }, head);
    b.place(done);
    b.emit(I::Ret { src: prev });

    let mut bodies = vec![];
    install(rt, b, &mut bodies)?;
    Ok(Program { entry: m, bodies })
}

fn sum_squares(rt: &mut Runtime) -> Result<Program, VmError> {
    let c = rt.define_class(ClassDef::class("Demo.Arrays"))?;
    let int_array = rt.define_array(TypeDesc::I4, 1)?;
    let m = rt.define_method(MethodDef::new(c, "SumSquares").params([TypeDesc::I4]).returns(TypeDesc::I4))?;

    let mut b = InterpMethodBuilder::new(rt, m, &[TypeDesc::Object(int_array), TypeDesc::I4, TypeDesc::I4])?;
    let n = b.arg(0)?;
    let (arr, i, total) = (b.local(0)?, b.local(1)?, b.local(2)?);
    let (one, sq, len) = (b.eval(0), b.eval(1), b.eval(2));
    b.emit(I::Newarr {
        dst: arr,
        class: int_array,
        len: n,
    });
    b.emit(I::LdcI4 { dst: one, value: 1 });

    let (fill, filled) = (b.new_label(), b.new_label());
    b.place(fill);
    b.emit_branch(|target| I::BgeI4 { a: i, b: n, target }, filled);
    b.emit(I::MulI4 { dst: sq, a: i, b: i });
    b.emit(I::StelemI4 {
        arr,
        index: i,
        src: sq,
    });
    b.emit(I::AddI4 { dst: i, a: i, b: one });
    b.emit_branch(|target| I::Br { target }, fill);
    b.place(filled);

    let (sum, done) = (b.new_label(), b.new_label());
    b.emit(I::LdcI4 { dst: i, value: 0 });
    b.emit(I::Ldlen { dst: len, arr });
    b.place(sum);
    b.emit_branch(|target| I::BgeI4 { a: i, b: len, target }, done);
    b.emit(I::LdelemI4 { dst: sq, arr, index: i });
    b.emit(I::AddI4 {
        dst: total,
        a: total,
        b: sq,
    });
    b.emit(I::AddI4 { dst: i, a: i, b: one });
    b.emit_branch(|target| I::Br { target }, sum);
    b.place(done);
    b.emit(I::Ret { src: total });

    let mut bodies = vec![];
    install(rt, b, &mut bodies)?;
    Ok(Program { entry: m, bodies })
}

fn guarded_divide(rt: &mut Runtime) -> Result<Program, VmError> {
    let c = rt.define_class(ClassDef::class("Demo.Guarded").static_field("Calls", TypeDesc::I4))?;
    let calls = field_offset(rt, c, "Calls")?;
    let divide_by_zero = rt.exception_class(ExceptionKind::DivideByZero);
    let m = rt.define_method(MethodDef::new(c, "Divide").params([TypeDesc::I4]).returns(TypeDesc::I4))?;

    let mut b = InterpMethodBuilder::new(rt, m, &[TypeDesc::I4])?;
    let n = b.arg(0)?;
    let result = b.local(0)?;
    let (k, one) = (b.eval(0), b.eval(1));
    let after = b.new_label();

    let try_start = b.here();
    b.emit(I::LdcI4 { dst: k, value: 1000 });
    b.emit(I::DivI4 { dst: result, a: k, b: n });
    b.emit_branch(|target| I::Leave { target }, after);
    let catch_start = b.here();
    b.emit(I::LdcI4 { dst: result, value: -1 });
    b.emit_branch(|target| I::Leave { target }, after);
    let finally_start = b.here();
    b.emit(I::LdsfldI4 {
        dst: k,
        class: c,
        offset: calls,
    });
    b.emit(I::LdcI4 { dst: one, value: 1 });
    b.emit(I::AddI4 { dst: k, a: k, b: one });
    b.emit(I::StsfldI4 {
        class: c,
        offset: calls,
        src: k,
    });
    b.emit(I::EndFinally {});
    b.place(after);
    b.emit(I::Ret { src: result });

    b.add_clause(
        Handler::Catch(divide_by_zero),
        (try_start, catch_start),
        (catch_start, finally_start),
    );
    b.add_clause(Handler::Finally, (try_start, finally_start), (finally_start, after));

    let mut bodies = vec![];
    install(rt, b, &mut bodies)?;
    Ok(Program { entry: m, bodies })
}

fn delegate(rt: &mut Runtime) -> Result<Program, VmError> {
    let func = rt.define_class(ClassDef::delegate("Demo.IntFunc"))?;
    let c = rt.define_class(ClassDef::class("Demo.Delegates"))?;
    let square = rt.define_method(MethodDef::new(c, "Square").params([TypeDesc::I4]).returns(TypeDesc::I4))?;
    let main = rt.define_method(MethodDef::new(c, "Apply").params([TypeDesc::I4]).returns(TypeDesc::I4))?;

    let mut b = InterpMethodBuilder::new(rt, square, &[])?;
    let x = b.arg(0)?;
    let t = b.eval(0);
    b.emit(I::MulI4 { dst: t, a: x, b: x });
    b.emit(I::Ret { src: t });
    let mut bodies = vec![];

    let mut a = InterpMethodBuilder::new(rt, main, &[])?;
    let n = a.arg(0)?;
    let (fnptr, receiver, d, arg, ret) = (a.eval(0), a.eval(1), a.eval(2), a.eval(3), a.eval(4));
    a.emit(I::Ldftn { dst: fnptr, method: square });
    a.emit(I::Ldnull { dst: receiver });
    a.emit(I::NewDelegate {
        dst: d,
        class: func,
        receiver,
        fnptr,
    });
    a.emit(I::Mov4 { dst: arg, src: n });
    a.emit(I::CallDelegateRet { arg_base: d, ret });
    a.emit(I::Ret { src: ret });

    install(rt, a, &mut bodies)?;
    install(rt, b, &mut bodies)?;
    Ok(Program { entry: main, bodies })
}

fn virtual_dispatch(rt: &mut Runtime) -> Result<Program, VmError> {
    let shape = rt.define_class(ClassDef::interface("Demo.IShape"))?;
    let area = rt.define_method(MethodDef::new(shape, "Area").returns(TypeDesc::I4))?;
    let base = rt.define_class(ClassDef::class("Demo.ShapeBase").implements(shape))?;
    rt.define_method(
        MethodDef::new(base, "Area")
            .virtual_method()
            .returns(TypeDesc::I4)
            .native(|_, _, ret| {
                ret[0] = StackObject::from_i32(0);
                Ok(())
            }),
    )?;
    let square = rt.define_class(ClassDef::class("Demo.Square").extends(base).field("side", TypeDesc::I4))?;
    let side = field_offset(rt, square, "side")?;
    let square_area = rt.define_method(MethodDef::new(square, "Area").virtual_method().returns(TypeDesc::I4))?;
    let c = rt.define_class(ClassDef::class("Demo.Shapes"))?;
    let main = rt.define_method(MethodDef::new(c, "Measure").params([TypeDesc::I4]).returns(TypeDesc::I4))?;

    let mut o = InterpMethodBuilder::new(rt, square_area, &[])?;
    let this = o.arg(0)?;
    let s = o.eval(0);
    o.emit(I::LdfldI4 {
        dst: s,
        obj: this,
        offset: side,
    });
    o.emit(I::MulI4 { dst: s, a: s, b: s });
    o.emit(I::Ret { src: s });

    let mut b = InterpMethodBuilder::new(rt, main, &[])?;
    let n = b.arg(0)?;
    let (obj, ret) = (b.eval(0), b.eval(1));
    b.emit(I::NewObjNoCtor { dst: obj, class: square });
    b.emit(I::StfldI4 {
        obj,
        offset: side,
        src: n,
    });
    b.emit(I::CallVirtualRet {
        method: area,
        arg_base: obj,
        ret,
    });
    b.emit(I::Ret { src: ret });

    let mut bodies = vec![];
    install(rt, b, &mut bodies)?;
    install(rt, o, &mut bodies)?;
    Ok(Program { entry: main, bodies })
}
