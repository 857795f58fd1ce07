//! The instruction catalogue.
//!
//! Every instruction is a 2-byte little-endian opcode followed by a fixed
//! sequence of operands determined by the opcode alone. The catalogue below is
//! the single source for the opcode enum, the decoded [`Instruction`] enum, the
//! static size table, encoding, decoding and the handler registry.
use crate::{
    types::{ClassHandle, MethodHandle},
    vm::{error::DecodeError, instructions::InstructionHandler},
};
use std::fmt::{self, Debug, Formatter};

/// Frame slot operand, counted from the frame base (argument 0).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Slot(pub u16);

impl Slot {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn offset(self, n: u16) -> Slot {
        Slot(self.0 + n)
    }
}

impl Debug for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Absolute branch target within the method's code stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Target(pub u32);

impl Debug for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04x}", self.0)
    }
}

/// Numeric kinds for `Conv`. Narrow kinds as sources are read as 32-bit
/// stack values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NumKind {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
}

impl NumKind {
    const ALL: [NumKind; 10] = [
        NumKind::I1,
        NumKind::U1,
        NumKind::I2,
        NumKind::U2,
        NumKind::I4,
        NumKind::U4,
        NumKind::I8,
        NumKind::U8,
        NumKind::R4,
        NumKind::R8,
    ];

    pub fn is_float(self) -> bool {
        matches!(self, NumKind::R4 | NumKind::R8)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, NumKind::U1 | NumKind::U2 | NumKind::U4 | NumKind::U8)
    }
}

/// A fixed-width operand type.
pub trait Operand: Copy + Debug {
    const SIZE: usize;
    /// `bytes` is exactly `SIZE` long. `None` means the bytes are not a valid value.
    fn read(bytes: &[u8]) -> Option<Self>;
    fn write(self, out: &mut Vec<u8>);
    fn branch_target(self) -> Option<u32> {
        None
    }
    fn frame_slot(self) -> Option<Slot> {
        None
    }
}

macro_rules! le_operand {
    ($($t:ty),*) => {
        $(
            impl Operand for $t {
                const SIZE: usize = std::mem::size_of::<$t>();
                fn read(bytes: &[u8]) -> Option<Self> {
                    Some(<$t>::from_le_bytes(bytes.try_into().ok()?))
                }
                fn write(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

le_operand!(u8, u16, u32, i32, i64, f32, f64);

macro_rules! newtype_operand {
    ($($t:ident($inner:ty)),*) => {
        $(
            impl Operand for $t {
                const SIZE: usize = <$inner as Operand>::SIZE;
                fn read(bytes: &[u8]) -> Option<Self> {
                    <$inner>::read(bytes).map($t)
                }
                fn write(self, out: &mut Vec<u8>) {
                    self.0.write(out)
                }
            }
        )*
    };
}

newtype_operand!(ClassHandle(u32), MethodHandle(u32));

impl Operand for Slot {
    const SIZE: usize = 2;
    fn read(bytes: &[u8]) -> Option<Self> {
        u16::read(bytes).map(Slot)
    }
    fn write(self, out: &mut Vec<u8>) {
        self.0.write(out)
    }
    fn frame_slot(self) -> Option<Slot> {
        Some(self)
    }
}

impl Operand for Target {
    const SIZE: usize = 4;
    fn read(bytes: &[u8]) -> Option<Self> {
        u32::read(bytes).map(Target)
    }
    fn write(self, out: &mut Vec<u8>) {
        self.0.write(out)
    }
    fn branch_target(self) -> Option<u32> {
        Some(self.0)
    }
}

impl Operand for NumKind {
    const SIZE: usize = 1;
    fn read(bytes: &[u8]) -> Option<Self> {
        NumKind::ALL.get(*bytes.first()? as usize).copied()
    }
    fn write(self, out: &mut Vec<u8>) {
        out.push(self as u8)
    }
}

/// Bounds-checked cursor over one instruction's operands.
pub struct OperandDecoder<'a> {
    codes: &'a [u8],
    start: usize,
    pos: usize,
}

impl<'a> OperandDecoder<'a> {
    pub fn new(codes: &'a [u8], start: usize) -> Self {
        Self {
            codes,
            start,
            pos: start,
        }
    }

    pub fn read<T: Operand>(&mut self) -> Result<T, DecodeError> {
        let bytes = self
            .codes
            .get(self.pos..self.pos + T::SIZE)
            .ok_or(DecodeError::Truncated { offset: self.start })?;
        let value = T::read(bytes).ok_or(DecodeError::BadOperand { offset: self.start })?;
        self.pos += T::SIZE;
        Ok(value)
    }
}

macro_rules! handler {
    ($family:ident, $name:ident) => {
        crate::vm::instructions::$family::execute as InstructionHandler
    };
}

macro_rules! define_instructions {
    ($(
        $family:ident {
            $( $name:ident { $($field:ident : $ty:ty),* $(,)? } ),* $(,)?
        }
    )*) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Opcode {
            $($($name,)*)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$($(Opcode::$name,)*)*];
            pub const COUNT: usize = Self::ALL.len();

            pub fn from_u16(raw: u16) -> Option<Opcode> {
                Self::ALL.get(raw as usize).copied()
            }

            pub fn name(self) -> &'static str {
                match self {
                    $($(Opcode::$name => stringify!($name),)*)*
                }
            }

            /// Handler module the opcode belongs to.
            pub fn family(self) -> &'static str {
                match self {
                    $($(Opcode::$name => stringify!($family),)*)*
                }
            }

            /// Encoded length in bytes, opcode included.
            #[inline]
            pub fn size(self) -> usize {
                INSTRUCTION_SIZES[self as usize]
            }
        }

        /// Encoded length of every opcode, indexed by opcode value.
        pub static INSTRUCTION_SIZES: [usize; Opcode::COUNT] = [
            $($(2 $(+ <$ty as Operand>::SIZE)*,)*)*
        ];

        pub(crate) static HANDLERS: [InstructionHandler; Opcode::COUNT] = [
            $($(handler!($family, $name),)*)*
        ];

        /// A decoded instruction.
        #[derive(Clone, Copy, Debug, PartialEq)]
        pub enum Instruction {
            $($($name { $($field: $ty),* },)*)*
        }

        impl Instruction {
            pub fn opcode(&self) -> Opcode {
                match self {
                    $($(Instruction::$name { .. } => Opcode::$name,)*)*
                }
            }

            pub fn encode(&self, out: &mut Vec<u8>) {
                match *self {
                    $($(Instruction::$name { $($field),* } => {
                        out.extend_from_slice(&(Opcode::$name as u16).to_le_bytes());
                        $($field.write(out);)*
                    })*)*
                }
            }

            pub fn decode(codes: &[u8], offset: usize) -> Result<Instruction, DecodeError> {
                let mut d = OperandDecoder::new(codes, offset);
                let raw: u16 = d.read()?;
                let opcode = Opcode::from_u16(raw)
                    .ok_or(DecodeError::UnknownOpcode { offset, opcode: raw })?;
                if codes.len() < offset + opcode.size() {
                    return Err(DecodeError::Truncated { offset });
                }
                Ok(match opcode {
                    $($(Opcode::$name => Instruction::$name { $($field: d.read()?),* },)*)*
                })
            }

            /// Branch target operand, if the instruction has one.
            pub fn branch_target(&self) -> Option<u32> {
                match *self {
                    $($(Instruction::$name { $($field),* } => {
                        None $(.or($field.branch_target()))*
                    })*)*
                }
            }

            /// Highest frame slot named by an operand.
            pub fn max_slot(&self) -> Option<Slot> {
                match *self {
                    $($(Instruction::$name { $($field),* } => {
                        None $(.max($field.frame_slot()))*
                    })*)*
                }
            }
        }
    };
}

define_instructions! {
    memory {
        Nop {},
        InitLocals { base: Slot, count: u16 },
        MovI1 { dst: Slot, src: Slot },
        MovU1 { dst: Slot, src: Slot },
        MovI2 { dst: Slot, src: Slot },
        MovU2 { dst: Slot, src: Slot },
        Mov4 { dst: Slot, src: Slot },
        Mov8 { dst: Slot, src: Slot },
        MovN { dst: Slot, src: Slot, size: u16 },
        LdcI4 { dst: Slot, value: i32 },
        LdcI8 { dst: Slot, value: i64 },
        LdcR4 { dst: Slot, value: f32 },
        LdcR8 { dst: Slot, value: f64 },
        Ldnull { dst: Slot },
        LdlocAddr { dst: Slot, src: Slot },
        LdindI1 { dst: Slot, addr: Slot },
        LdindU1 { dst: Slot, addr: Slot },
        LdindI2 { dst: Slot, addr: Slot },
        LdindU2 { dst: Slot, addr: Slot },
        LdindI4 { dst: Slot, addr: Slot },
        LdindI8 { dst: Slot, addr: Slot },
        StindI1 { addr: Slot, src: Slot },
        StindI2 { addr: Slot, src: Slot },
        StindI4 { addr: Slot, src: Slot },
        StindI8 { addr: Slot, src: Slot },
        StindRef { addr: Slot, src: Slot },
        LdobjN { dst: Slot, addr: Slot, size: u16 },
        StobjN { addr: Slot, src: Slot, size: u16 },
        InitobjN { addr: Slot, size: u16 },
        CpobjN { dst: Slot, src: Slot, size: u16 },
        Localloc { dst: Slot, size: Slot },
        Initblk { addr: Slot, value: Slot, size: Slot },
        Cpblk { dst: Slot, src: Slot, size: Slot },
        MemoryBarrier {},
    }
    conversions {
        Conv { dst: Slot, src: Slot, from: NumKind, to: NumKind },
        ConvOvf { dst: Slot, src: Slot, from: NumKind, to: NumKind },
        CheckFiniteR4 { src: Slot },
        CheckFiniteR8 { src: Slot },
    }
    arithmetic {
        AddI4 { dst: Slot, a: Slot, b: Slot },
        SubI4 { dst: Slot, a: Slot, b: Slot },
        MulI4 { dst: Slot, a: Slot, b: Slot },
        DivI4 { dst: Slot, a: Slot, b: Slot },
        DivUnI4 { dst: Slot, a: Slot, b: Slot },
        RemI4 { dst: Slot, a: Slot, b: Slot },
        RemUnI4 { dst: Slot, a: Slot, b: Slot },
        AndI4 { dst: Slot, a: Slot, b: Slot },
        OrI4 { dst: Slot, a: Slot, b: Slot },
        XorI4 { dst: Slot, a: Slot, b: Slot },
        ShlI4 { dst: Slot, a: Slot, b: Slot },
        ShrI4 { dst: Slot, a: Slot, b: Slot },
        ShrUnI4 { dst: Slot, a: Slot, b: Slot },
        AddI8 { dst: Slot, a: Slot, b: Slot },
        SubI8 { dst: Slot, a: Slot, b: Slot },
        MulI8 { dst: Slot, a: Slot, b: Slot },
        DivI8 { dst: Slot, a: Slot, b: Slot },
        DivUnI8 { dst: Slot, a: Slot, b: Slot },
        RemI8 { dst: Slot, a: Slot, b: Slot },
        RemUnI8 { dst: Slot, a: Slot, b: Slot },
        AndI8 { dst: Slot, a: Slot, b: Slot },
        OrI8 { dst: Slot, a: Slot, b: Slot },
        XorI8 { dst: Slot, a: Slot, b: Slot },
        ShlI8 { dst: Slot, a: Slot, b: Slot },
        ShrI8 { dst: Slot, a: Slot, b: Slot },
        ShrUnI8 { dst: Slot, a: Slot, b: Slot },
        AddR4 { dst: Slot, a: Slot, b: Slot },
        SubR4 { dst: Slot, a: Slot, b: Slot },
        MulR4 { dst: Slot, a: Slot, b: Slot },
        DivR4 { dst: Slot, a: Slot, b: Slot },
        RemR4 { dst: Slot, a: Slot, b: Slot },
        AddR8 { dst: Slot, a: Slot, b: Slot },
        SubR8 { dst: Slot, a: Slot, b: Slot },
        MulR8 { dst: Slot, a: Slot, b: Slot },
        DivR8 { dst: Slot, a: Slot, b: Slot },
        RemR8 { dst: Slot, a: Slot, b: Slot },
        AddOvfI4 { dst: Slot, a: Slot, b: Slot },
        AddOvfUnI4 { dst: Slot, a: Slot, b: Slot },
        SubOvfI4 { dst: Slot, a: Slot, b: Slot },
        SubOvfUnI4 { dst: Slot, a: Slot, b: Slot },
        MulOvfI4 { dst: Slot, a: Slot, b: Slot },
        MulOvfUnI4 { dst: Slot, a: Slot, b: Slot },
        AddOvfI8 { dst: Slot, a: Slot, b: Slot },
        AddOvfUnI8 { dst: Slot, a: Slot, b: Slot },
        SubOvfI8 { dst: Slot, a: Slot, b: Slot },
        SubOvfUnI8 { dst: Slot, a: Slot, b: Slot },
        MulOvfI8 { dst: Slot, a: Slot, b: Slot },
        MulOvfUnI8 { dst: Slot, a: Slot, b: Slot },
        NegI4 { dst: Slot, src: Slot },
        NegI8 { dst: Slot, src: Slot },
        NegR4 { dst: Slot, src: Slot },
        NegR8 { dst: Slot, src: Slot },
        NotI4 { dst: Slot, src: Slot },
        NotI8 { dst: Slot, src: Slot },
    }
    comparisons {
        CeqI4 { dst: Slot, a: Slot, b: Slot },
        CgtI4 { dst: Slot, a: Slot, b: Slot },
        CgtUnI4 { dst: Slot, a: Slot, b: Slot },
        CltI4 { dst: Slot, a: Slot, b: Slot },
        CltUnI4 { dst: Slot, a: Slot, b: Slot },
        CeqI8 { dst: Slot, a: Slot, b: Slot },
        CgtI8 { dst: Slot, a: Slot, b: Slot },
        CgtUnI8 { dst: Slot, a: Slot, b: Slot },
        CltI8 { dst: Slot, a: Slot, b: Slot },
        CltUnI8 { dst: Slot, a: Slot, b: Slot },
        CeqR4 { dst: Slot, a: Slot, b: Slot },
        CgtR4 { dst: Slot, a: Slot, b: Slot },
        CgtUnR4 { dst: Slot, a: Slot, b: Slot },
        CltR4 { dst: Slot, a: Slot, b: Slot },
        CltUnR4 { dst: Slot, a: Slot, b: Slot },
        CeqR8 { dst: Slot, a: Slot, b: Slot },
        CgtR8 { dst: Slot, a: Slot, b: Slot },
        CgtUnR8 { dst: Slot, a: Slot, b: Slot },
        CltR8 { dst: Slot, a: Slot, b: Slot },
        CltUnR8 { dst: Slot, a: Slot, b: Slot },
    }
    flow {
        Br { target: Target },
        BrTrueI4 { cond: Slot, target: Target },
        BrFalseI4 { cond: Slot, target: Target },
        BrTrueI8 { cond: Slot, target: Target },
        BrFalseI8 { cond: Slot, target: Target },
        BeqI4 { a: Slot, b: Slot, target: Target },
        BneUnI4 { a: Slot, b: Slot, target: Target },
        BgeI4 { a: Slot, b: Slot, target: Target },
        BgeUnI4 { a: Slot, b: Slot, target: Target },
        BgtI4 { a: Slot, b: Slot, target: Target },
        BgtUnI4 { a: Slot, b: Slot, target: Target },
        BleI4 { a: Slot, b: Slot, target: Target },
        BleUnI4 { a: Slot, b: Slot, target: Target },
        BltI4 { a: Slot, b: Slot, target: Target },
        BltUnI4 { a: Slot, b: Slot, target: Target },
        BeqI8 { a: Slot, b: Slot, target: Target },
        BneUnI8 { a: Slot, b: Slot, target: Target },
        BgeI8 { a: Slot, b: Slot, target: Target },
        BgeUnI8 { a: Slot, b: Slot, target: Target },
        BgtI8 { a: Slot, b: Slot, target: Target },
        BgtUnI8 { a: Slot, b: Slot, target: Target },
        BleI8 { a: Slot, b: Slot, target: Target },
        BleUnI8 { a: Slot, b: Slot, target: Target },
        BltI8 { a: Slot, b: Slot, target: Target },
        BltUnI8 { a: Slot, b: Slot, target: Target },
        BeqR4 { a: Slot, b: Slot, target: Target },
        BneUnR4 { a: Slot, b: Slot, target: Target },
        BgeR4 { a: Slot, b: Slot, target: Target },
        BgeUnR4 { a: Slot, b: Slot, target: Target },
        BgtR4 { a: Slot, b: Slot, target: Target },
        BgtUnR4 { a: Slot, b: Slot, target: Target },
        BleR4 { a: Slot, b: Slot, target: Target },
        BleUnR4 { a: Slot, b: Slot, target: Target },
        BltR4 { a: Slot, b: Slot, target: Target },
        BltUnR4 { a: Slot, b: Slot, target: Target },
        BeqR8 { a: Slot, b: Slot, target: Target },
        BneUnR8 { a: Slot, b: Slot, target: Target },
        BgeR8 { a: Slot, b: Slot, target: Target },
        BgeUnR8 { a: Slot, b: Slot, target: Target },
        BgtR8 { a: Slot, b: Slot, target: Target },
        BgtUnR8 { a: Slot, b: Slot, target: Target },
        BleR8 { a: Slot, b: Slot, target: Target },
        BleUnR8 { a: Slot, b: Slot, target: Target },
        BltR8 { a: Slot, b: Slot, target: Target },
        BltUnR8 { a: Slot, b: Slot, target: Target },
        Switch { value: Slot, table: u32 },
        RetVoid {},
        Ret { src: Slot },
        RetN { src: Slot, size: u16 },
    }
    objects {
        NewObjNoCtor { dst: Slot, class: ClassHandle },
        NewObjInterp { dst: Slot, method: MethodHandle, arg_base: Slot },
        NewObjNative { dst: Slot, method: MethodHandle, arg_base: Slot },
        NewValueTypeInterp { dst: Slot, method: MethodHandle, arg_base: Slot },
        NewValueTypeNative { dst: Slot, method: MethodHandle, arg_base: Slot },
        Box { dst: Slot, src: Slot, class: ClassHandle },
        Unbox { dst: Slot, obj: Slot, class: ClassHandle },
        UnboxAny { dst: Slot, obj: Slot, class: ClassHandle },
        CastClass { dst: Slot, obj: Slot, class: ClassHandle },
        IsInst { dst: Slot, obj: Slot, class: ClassHandle },
        Ldstr { dst: Slot, literal: u32 },
        NewDelegate { dst: Slot, class: ClassHandle, receiver: Slot, fnptr: Slot },
        Ldftn { dst: Slot, method: MethodHandle },
        Ldvirtftn { dst: Slot, obj: Slot, method: MethodHandle },
    }
    fields {
        LdfldI1 { dst: Slot, obj: Slot, offset: u32 },
        LdfldU1 { dst: Slot, obj: Slot, offset: u32 },
        LdfldI2 { dst: Slot, obj: Slot, offset: u32 },
        LdfldU2 { dst: Slot, obj: Slot, offset: u32 },
        LdfldI4 { dst: Slot, obj: Slot, offset: u32 },
        LdfldI8 { dst: Slot, obj: Slot, offset: u32 },
        LdfldN { dst: Slot, obj: Slot, offset: u32, size: u16 },
        LdvfldI1 { dst: Slot, src: Slot, offset: u32 },
        LdvfldU1 { dst: Slot, src: Slot, offset: u32 },
        LdvfldI2 { dst: Slot, src: Slot, offset: u32 },
        LdvfldU2 { dst: Slot, src: Slot, offset: u32 },
        LdvfldI4 { dst: Slot, src: Slot, offset: u32 },
        LdvfldI8 { dst: Slot, src: Slot, offset: u32 },
        LdvfldN { dst: Slot, src: Slot, offset: u32, size: u16 },
        Ldflda { dst: Slot, obj: Slot, offset: u32 },
        StfldI1 { obj: Slot, offset: u32, src: Slot },
        StfldI2 { obj: Slot, offset: u32, src: Slot },
        StfldI4 { obj: Slot, offset: u32, src: Slot },
        StfldI8 { obj: Slot, offset: u32, src: Slot },
        StfldRef { obj: Slot, offset: u32, src: Slot },
        StfldN { obj: Slot, offset: u32, src: Slot, size: u16 },
        LdsfldI1 { dst: Slot, class: ClassHandle, offset: u32 },
        LdsfldU1 { dst: Slot, class: ClassHandle, offset: u32 },
        LdsfldI2 { dst: Slot, class: ClassHandle, offset: u32 },
        LdsfldU2 { dst: Slot, class: ClassHandle, offset: u32 },
        LdsfldI4 { dst: Slot, class: ClassHandle, offset: u32 },
        LdsfldI8 { dst: Slot, class: ClassHandle, offset: u32 },
        LdsfldN { dst: Slot, class: ClassHandle, offset: u32, size: u16 },
        StsfldI1 { class: ClassHandle, offset: u32, src: Slot },
        StsfldI2 { class: ClassHandle, offset: u32, src: Slot },
        StsfldI4 { class: ClassHandle, offset: u32, src: Slot },
        StsfldI8 { class: ClassHandle, offset: u32, src: Slot },
        StsfldRef { class: ClassHandle, offset: u32, src: Slot },
        StsfldN { class: ClassHandle, offset: u32, src: Slot, size: u16 },
        Ldsflda { dst: Slot, class: ClassHandle, offset: u32 },
        LdtsfldI4 { dst: Slot, class: ClassHandle, offset: u32 },
        LdtsfldI8 { dst: Slot, class: ClassHandle, offset: u32 },
        LdtsfldN { dst: Slot, class: ClassHandle, offset: u32, size: u16 },
        SttsfldI4 { class: ClassHandle, offset: u32, src: Slot },
        SttsfldI8 { class: ClassHandle, offset: u32, src: Slot },
        SttsfldRef { class: ClassHandle, offset: u32, src: Slot },
        SttsfldN { class: ClassHandle, offset: u32, src: Slot, size: u16 },
        Ldtsflda { dst: Slot, class: ClassHandle, offset: u32 },
    }
    arrays {
        Newarr { dst: Slot, class: ClassHandle, len: Slot },
        Ldlen { dst: Slot, arr: Slot },
        LdelemI1 { dst: Slot, arr: Slot, index: Slot },
        LdelemU1 { dst: Slot, arr: Slot, index: Slot },
        LdelemI2 { dst: Slot, arr: Slot, index: Slot },
        LdelemU2 { dst: Slot, arr: Slot, index: Slot },
        LdelemI4 { dst: Slot, arr: Slot, index: Slot },
        LdelemI8 { dst: Slot, arr: Slot, index: Slot },
        LdelemN { dst: Slot, arr: Slot, index: Slot, size: u16 },
        StelemI1 { arr: Slot, index: Slot, src: Slot },
        StelemI2 { arr: Slot, index: Slot, src: Slot },
        StelemI4 { arr: Slot, index: Slot, src: Slot },
        StelemI8 { arr: Slot, index: Slot, src: Slot },
        StelemRef { arr: Slot, index: Slot, src: Slot },
        StelemN { arr: Slot, index: Slot, src: Slot, size: u16 },
        Ldelema { dst: Slot, arr: Slot, index: Slot, class: ClassHandle },
        LdelemaReadonly { dst: Slot, arr: Slot, index: Slot },
        NewMdArr { dst: Slot, class: ClassHandle, lengths: u32 },
        NewMdArrBounded { dst: Slot, class: ClassHandle, lengths: u32, bounds: u32 },
        GetMdElem { dst: Slot, arr: Slot, indices: u32 },
        SetMdElem { arr: Slot, indices: u32, src: Slot },
        GetMdElemAddr { dst: Slot, arr: Slot, indices: u32 },
    }
    calls {
        CallInterpVoid { method: MethodHandle, arg_base: Slot },
        CallInterpRet { method: MethodHandle, arg_base: Slot, ret: Slot },
        CallNativeVoid { method: MethodHandle, arg_base: Slot },
        CallNativeRet { method: MethodHandle, arg_base: Slot, ret: Slot },
        CallVirtualVoid { method: MethodHandle, arg_base: Slot },
        CallVirtualRet { method: MethodHandle, arg_base: Slot, ret: Slot },
        CallIndVoid { fnptr: Slot, arg_base: Slot },
        CallIndRet { fnptr: Slot, arg_base: Slot, ret: Slot },
        CallDelegateVoid { arg_base: Slot },
        CallDelegateRet { arg_base: Slot, ret: Slot },
    }
    exceptions {
        Throw { ex: Slot },
        Rethrow {},
        Leave { target: Target },
        EndFilter { value: Slot },
        EndFinally {},
    }
}

/// Walks `codes` once, checking every instruction decodes and every branch
/// lands on an instruction boundary. Returns the instruction start offsets.
pub fn validate(codes: &[u8]) -> Result<Vec<usize>, DecodeError> {
    let listing = disassemble(codes)?;
    let starts: Vec<usize> = listing.iter().map(|(offset, _)| *offset).collect();
    for (offset, instr) in &listing {
        if let Some(target) = instr.branch_target() {
            let target = target as usize;
            if starts.binary_search(&target).is_err() {
                return Err(DecodeError::BadBranchTarget {
                    offset: *offset,
                    target,
                });
            }
        }
    }
    Ok(starts)
}

pub fn disassemble(codes: &[u8]) -> Result<Vec<(usize, Instruction)>, DecodeError> {
    let mut out = vec![];
    let mut offset = 0;
    while offset < codes.len() {
        let instr = Instruction::decode(codes, offset)?;
        out.push((offset, instr));
        offset += instr.opcode().size();
    }
    Ok(out)
}

/// One line per instruction, e.g. `IL_0004: AddI4 { dst: $2, a: $0, b: $1 }`.
pub fn listing(codes: &[u8]) -> Result<String, DecodeError> {
    use std::fmt::Write;
    let mut s = String::new();
    for (offset, instr) in disassemble(codes)? {
        let _ = writeln!(s, "IL_{offset:04x}: {instr:?}");
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_table_matches_encoding() {
        let samples = [
            Instruction::Nop {},
            Instruction::AddI4 {
                dst: Slot(2),
                a: Slot(0),
                b: Slot(1),
            },
            Instruction::LdcR8 {
                dst: Slot(3),
                value: 1.5,
            },
            Instruction::Conv {
                dst: Slot(1),
                src: Slot(1),
                from: NumKind::R8,
                to: NumKind::U2,
            },
            Instruction::NewMdArrBounded {
                dst: Slot(0),
                class: ClassHandle(9),
                lengths: 1,
                bounds: 2,
            },
            Instruction::BltUnR4 {
                a: Slot(0),
                b: Slot(1),
                target: Target(0),
            },
        ];
        for instr in samples {
            let mut buf = vec![];
            instr.encode(&mut buf);
            assert_eq!(buf.len(), instr.opcode().size(), "{instr:?}");
            assert_eq!(Instruction::decode(&buf, 0).unwrap(), instr);
        }
    }

    #[test]
    fn every_opcode_has_a_handler_and_name() {
        assert_eq!(HANDLERS.len(), Opcode::COUNT);
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(*op as usize, i);
            assert_eq!(Opcode::from_u16(i as u16), Some(*op));
            assert!(op.size() >= 2);
        }
        assert_eq!(Opcode::from_u16(Opcode::COUNT as u16), None);
        assert_eq!(Opcode::MulOvfUnI8.family(), "arithmetic");
    }

    #[test]
    fn rejects_truncated_and_unknown() {
        let mut buf = vec![];
        Instruction::LdcI4 {
            dst: Slot(0),
            value: 7,
        }
        .encode(&mut buf);
        buf.pop();
        assert_eq!(
            Instruction::decode(&buf, 0),
            Err(DecodeError::Truncated { offset: 0 })
        );
        let bogus = (Opcode::COUNT as u16).to_le_bytes();
        assert!(matches!(
            Instruction::decode(&bogus, 0),
            Err(DecodeError::UnknownOpcode { .. })
        ));
    }

    #[test]
    fn validate_checks_branch_boundaries() {
        let mut buf = vec![];
        Instruction::Br { target: Target(6) }.encode(&mut buf);
        Instruction::RetVoid {}.encode(&mut buf);
        assert_eq!(validate(&buf).unwrap(), vec![0, 6]);

        let mut bad = vec![];
        Instruction::Br { target: Target(3) }.encode(&mut bad);
        Instruction::RetVoid {}.encode(&mut bad);
        assert_eq!(
            validate(&bad),
            Err(DecodeError::BadBranchTarget {
                offset: 0,
                target: 3
            })
        );
    }

    #[test]
    fn listing_names_operands() {
        let mut buf = vec![];
        Instruction::Leave { target: Target(0) }.encode(&mut buf);
        let text = listing(&buf).unwrap();
        assert_eq!(text.trim(), "IL_0000: Leave { target: IL_0000 }");
    }
}
