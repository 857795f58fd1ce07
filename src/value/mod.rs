//! Untyped stack slots and the two kinds of values that live in them besides
//! plain numbers: object references and managed addresses.
use crate::{types::ClassHandle, vm::error::MemoryError};
use std::{
    fmt::{self, Debug, Formatter},
    num::NonZeroU32,
};

pub mod object;
pub mod storage;

/// One 8-byte evaluation stack slot. The slot carries no type; the bytecode
/// that reads it decides how to interpret the bits.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct StackObject(pub u64);

impl StackObject {
    pub const ZERO: StackObject = StackObject(0);

    pub fn from_i32(v: i32) -> Self {
        Self(v as u32 as u64)
    }
    pub fn from_i64(v: i64) -> Self {
        Self(v as u64)
    }
    pub fn from_f32(v: f32) -> Self {
        Self(v.to_bits() as u64)
    }
    pub fn from_f64(v: f64) -> Self {
        Self(v.to_bits())
    }
    pub fn from_ref(v: Option<ObjectRef>) -> Self {
        Self(ObjectRef::to_word(v))
    }
    pub fn from_address(v: Option<Address>) -> Self {
        Self(v.map_or(0, Address::to_word))
    }

    pub fn as_i32(self) -> i32 {
        self.0 as u32 as i32
    }
    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }
    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }
    pub fn as_ref(self) -> Option<ObjectRef> {
        ObjectRef::from_word(self.0)
    }
    pub fn as_address(self) -> Result<Option<Address>, MemoryError> {
        Address::from_word(self.0)
    }
}

impl Debug for StackObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A value with a fixed little-endian byte representation that can be read
/// from or written to stack and heap memory.
pub trait SlotValue: Copy {
    const SIZE: usize;
    fn read_from(bytes: &[u8]) -> Self;
    fn write_to(self, bytes: &mut [u8]);
}

macro_rules! slot_value {
    ($($t:ty),*) => {
        $(
            impl SlotValue for $t {
                const SIZE: usize = std::mem::size_of::<$t>();
                #[inline]
                fn read_from(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(&bytes[..Self::SIZE]);
                    <$t>::from_le_bytes(buf)
                }
                #[inline]
                fn write_to(self, bytes: &mut [u8]) {
                    bytes[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

slot_value!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

impl SlotValue for Option<ObjectRef> {
    const SIZE: usize = 8;
    fn read_from(bytes: &[u8]) -> Self {
        ObjectRef::from_word(u64::read_from(bytes))
    }
    fn write_to(self, bytes: &mut [u8]) {
        ObjectRef::to_word(self).write_to(bytes)
    }
}

/// Handle to a heap object. Slot value 0 is the null reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(NonZeroU32);

impl ObjectRef {
    pub(crate) fn from_index(index: usize) -> Self {
        // index + 1 never wraps for heaps that fit in memory
        Self(NonZeroU32::MIN.saturating_add(index as u32))
    }

    pub fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    pub fn from_word(word: u64) -> Option<Self> {
        u32::try_from(word).ok().and_then(NonZeroU32::new).map(Self)
    }

    pub fn to_word(this: Option<Self>) -> u64 {
        this.map_or(0, |r| r.0.get() as u64)
    }
}

impl Debug for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

const TAG_SHIFT: u32 = 60;
const OFFSET_MASK: u64 = 0xffff_ffff;
const ID_MASK: u64 = (1 << (TAG_SHIFT - 32)) - 1;
const LOW_MASK: u64 = (1 << TAG_SHIFT) - 1;

const TAG_STACK: u64 = 1;
const TAG_LOCAL_ALLOC: u64 = 2;
const TAG_HEAP: u64 = 3;
const TAG_STATIC: u64 = 4;
const TAG_THREAD_STATIC: u64 = 5;

/// A managed or unmanaged pointer as seen by interpreted code.
///
/// Addresses fit in one slot: a 4-bit space tag, then either a byte offset
/// (stack spaces) or a 28-bit owner id plus a 32-bit byte offset. Adding an
/// integer to the encoded word moves the offset, so pointer arithmetic in
/// bytecode works on the raw slot value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Address {
    Stack(usize),
    LocalAlloc(usize),
    Heap { object: ObjectRef, offset: u32 },
    Static { class: ClassHandle, offset: u32 },
    ThreadStatic { class: ClassHandle, offset: u32 },
}

impl Address {
    pub fn to_word(self) -> u64 {
        let owned = |tag: u64, id: u64, offset: u32| {
            (tag << TAG_SHIFT) | ((id & ID_MASK) << 32) | offset as u64
        };
        match self {
            Address::Stack(o) => (TAG_STACK << TAG_SHIFT) | (o as u64 & LOW_MASK),
            Address::LocalAlloc(o) => (TAG_LOCAL_ALLOC << TAG_SHIFT) | (o as u64 & LOW_MASK),
            Address::Heap { object, offset } => {
                owned(TAG_HEAP, ObjectRef::to_word(Some(object)), offset)
            }
            Address::Static { class, offset } => owned(TAG_STATIC, class.0 as u64, offset),
            Address::ThreadStatic { class, offset } => {
                owned(TAG_THREAD_STATIC, class.0 as u64, offset)
            }
        }
    }

    pub fn from_word(word: u64) -> Result<Option<Address>, MemoryError> {
        if word == 0 {
            return Ok(None);
        }
        let id = (word >> 32) & ID_MASK;
        let offset = (word & OFFSET_MASK) as u32;
        let addr = match word >> TAG_SHIFT {
            TAG_STACK => Address::Stack((word & LOW_MASK) as usize),
            TAG_LOCAL_ALLOC => Address::LocalAlloc((word & LOW_MASK) as usize),
            TAG_HEAP => Address::Heap {
                object: ObjectRef::from_word(id).ok_or(MemoryError::AccessViolation(word))?,
                offset,
            },
            TAG_STATIC => Address::Static {
                class: ClassHandle(id as u32),
                offset,
            },
            TAG_THREAD_STATIC => Address::ThreadStatic {
                class: ClassHandle(id as u32),
                offset,
            },
            _ => return Err(MemoryError::AccessViolation(word)),
        };
        Ok(Some(addr))
    }

    pub fn offset_by(self, delta: isize) -> Address {
        let add32 = |o: u32| (o as i64 + delta as i64) as u32;
        match self {
            Address::Stack(o) => Address::Stack(o.wrapping_add_signed(delta)),
            Address::LocalAlloc(o) => Address::LocalAlloc(o.wrapping_add_signed(delta)),
            Address::Heap { object, offset } => Address::Heap {
                object,
                offset: add32(offset),
            },
            Address::Static { class, offset } => Address::Static {
                class,
                offset: add32(offset),
            },
            Address::ThreadStatic { class, offset } => Address::ThreadStatic {
                class,
                offset: add32(offset),
            },
        }
    }
}
