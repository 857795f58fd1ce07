mod common;

use common::{unhandled_class, TestHarness};
use hybrid_interp::{
    config::InterpreterConfig,
    runtime::Runtime,
    types::{ClassDef, MethodDef, MethodHandle, TypeDesc},
    value::StackObject,
    vm::{
        builder::InterpMethodBuilder,
        frame::{ArgSource, InterpFrameGroup, RetTarget},
        opcodes::{Instruction as I, Slot},
        stack::MachineState,
        Interpreter,
    },
};
use proptest::prelude::*;
use std::{cell::RefCell, sync::Arc};

type MakeOp = fn(Slot, Slot, Slot) -> I;

/// Checked operation, whether it is unsigned, and its exact result if it fits in `i128`.
struct CheckedOp {
    name: &'static str,
    make32: MakeOp,
    make64: MakeOp,
    unsigned: bool,
    exact: fn(i128, i128) -> Option<i128>,
}

const OPS: [CheckedOp; 6] = [
    CheckedOp {
        name: "add",
        make32: |dst, a, b| I::AddOvfI4 { dst, a, b },
        make64: |dst, a, b| I::AddOvfI8 { dst, a, b },
        unsigned: false,
        exact: i128::checked_add,
    },
    CheckedOp {
        name: "add.un",
        make32: |dst, a, b| I::AddOvfUnI4 { dst, a, b },
        make64: |dst, a, b| I::AddOvfUnI8 { dst, a, b },
        unsigned: true,
        exact: i128::checked_add,
    },
    CheckedOp {
        name: "sub",
        make32: |dst, a, b| I::SubOvfI4 { dst, a, b },
        make64: |dst, a, b| I::SubOvfI8 { dst, a, b },
        unsigned: false,
        exact: i128::checked_sub,
    },
    CheckedOp {
        name: "sub.un",
        make32: |dst, a, b| I::SubOvfUnI4 { dst, a, b },
        make64: |dst, a, b| I::SubOvfUnI8 { dst, a, b },
        unsigned: true,
        exact: i128::checked_sub,
    },
    CheckedOp {
        name: "mul",
        make32: |dst, a, b| I::MulOvfI4 { dst, a, b },
        make64: |dst, a, b| I::MulOvfI8 { dst, a, b },
        unsigned: false,
        exact: i128::checked_mul,
    },
    CheckedOp {
        name: "mul.un",
        make32: |dst, a, b| I::MulOvfUnI4 { dst, a, b },
        make64: |dst, a, b| I::MulOvfUnI8 { dst, a, b },
        unsigned: true,
        exact: i128::checked_mul,
    },
];

/// One interpreted method per checked operation, all on one runtime.
struct Checked {
    rt: Arc<Runtime>,
    interp: RefCell<Interpreter>,
    methods: Vec<MethodHandle>,
}

impl Checked {
    fn new(wide: bool) -> Self {
        let mut h = TestHarness::new();
        let ty = if wide { TypeDesc::I8 } else { TypeDesc::I4 };
        let methods = OPS
            .iter()
            .map(|op| {
                let m = h.method(op.name, &[ty, ty], ty);
                let make = if wide { op.make64 } else { op.make32 };
                h.body(m, &[], |b| {
                    let (x, y) = (b.arg(0)?, b.arg(1)?);
                    let t = b.eval(0);
                    b.emit(make(t, x, y));
                    b.emit(I::Ret { src: t });
                    Ok(())
                });
                m
            })
            .collect();
        let (rt, interp) = h.seal();
        Self {
            rt,
            interp: RefCell::new(interp),
            methods,
        }
    }

    /// Runs every operation on `(a, b)` and compares with the exact result.
    fn check(&self, a: i64, b: i64, bits: u32) -> Result<(), TestCaseError> {
        for (op, &m) in OPS.iter().zip(&self.methods) {
            let (ea, eb) = if op.unsigned {
                let mask = u64::MAX >> (64 - bits);
                ((a as u64 & mask) as i128, (b as u64 & mask) as i128)
            } else {
                (a as i128, b as i128)
            };
            let exact = (op.exact)(ea, eb);
            let (lo, hi) = if op.unsigned {
                (0, (1i128 << bits) - 1)
            } else {
                (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
            };
            let args = if bits == 32 {
                [StackObject::from_i32(a as i32), StackObject::from_i32(b as i32)]
            } else {
                [StackObject::from_i64(a), StackObject::from_i64(b)]
            };
            let result = self.interp.borrow_mut().call(m, &args);
            if let Some(exact) = exact.filter(|e| (lo..=hi).contains(e)) {
                let got = match (bits, op.unsigned) {
                    (32, false) => result.unwrap().as_i32() as i128,
                    (32, true) => result.unwrap().as_i32() as u32 as i128,
                    (_, false) => result.unwrap().as_i64() as i128,
                    (_, true) => result.unwrap().as_i64() as u64 as i128,
                };
                prop_assert_eq!(got, exact, "{} {} {}", op.name, a, b);
            } else {
                prop_assert_eq!(
                    unhandled_class(&self.rt, result),
                    "System.OverflowException",
                    "{} {} {}",
                    op.name,
                    a,
                    b
                );
            }
        }
        Ok(())
    }
}

/// Operands biased towards the edges where overflow happens.
fn edgy_i32() -> impl Strategy<Value = i32> {
    prop_oneof![
        any::<i32>(),
        Just(i32::MIN),
        Just(i32::MAX),
        Just(-1),
        Just(0),
        Just(1),
        -65_536..65_536i32,
    ]
}

fn edgy_i64() -> impl Strategy<Value = i64> {
    prop_oneof![
        any::<i64>(),
        Just(i64::MIN),
        Just(i64::MAX),
        Just(-1),
        Just(0),
        -(1i64 << 33)..(1i64 << 33),
    ]
}

#[test]
fn checked_32_bit_arithmetic_matches_exact_results() {
    let checked = Checked::new(false);
    proptest!(|(a in edgy_i32(), b in edgy_i32())| {
        checked.check(a as i64, b as i64, 32)?;
    });
}

#[test]
fn checked_64_bit_arithmetic_matches_exact_results() {
    let checked = Checked::new(true);
    proptest!(|(a in edgy_i64(), b in edgy_i64())| {
        checked.check(a, b, 64)?;
    });
}

/// Frame shapes for the push/pop property: `(locals, in_place)`.
fn frame_shapes() -> impl Strategy<Value = Vec<(usize, bool)>> {
    prop::collection::vec((0usize..6, any::<bool>()), 1..24)
}

proptest! {
    #[test]
    fn leaving_a_frame_restores_the_stack_top(shapes in frame_shapes()) {
        let mut rt = Runtime::with_config(InterpreterConfig::default());
        let class = rt.define_class(ClassDef::class("Frames")).unwrap();
        let infos: Vec<_> = shapes
            .iter()
            .enumerate()
            .map(|(i, &(locals, _))| {
                let m = rt
                    .define_method(MethodDef::new(class, format!("M{i}")).params([TypeDesc::I4, TypeDesc::I8]))
                    .unwrap();
                let mut b = InterpMethodBuilder::new(&rt, m, &vec![TypeDesc::I8; locals]).unwrap();
                b.reserve_eval(0, 3);
                b.emit(I::RetVoid {});
                Arc::new(b.finish().unwrap())
            })
            .collect();

        let mut machine = MachineState::new(16, 1 << 16);
        let group = InterpFrameGroup::new(&machine);
        let mut tops = vec![];
        let mut caller: Option<(usize, u16)> = None;
        for (info, &(_, in_place)) in infos.iter().zip(&shapes) {
            tops.push(machine.top());
            let args = match caller {
                Some((base, eval)) if in_place => ArgSource::InPlace(base + eval as usize + 1),
                _ => ArgSource::Deferred,
            };
            let base = group
                .enter_frame(&mut machine, info.clone(), args, RetTarget::Discard)
                .unwrap();
            prop_assert!(machine.top() >= base + info.max_stack_size as usize);
            caller = Some((base, info.eval_stack_base_offset));
        }
        prop_assert_eq!(group.depth(&machine), shapes.len());
        while let Some(expected) = tops.pop() {
            prop_assert!(group.leave_frame(&mut machine).is_some());
            prop_assert_eq!(machine.top(), expected);
        }
        prop_assert!(group.leave_frame(&mut machine).is_none());
        prop_assert_eq!(machine.top(), 0);
    }
}
