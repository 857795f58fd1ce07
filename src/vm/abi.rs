//! Argument classification.
//!
//! Every parameter and return type is mapped onto a [`LocationKind`], which
//! decides how it sits in the frame, how a host caller passes it and which
//! copy routine moves it. Architecture rules live behind [`ClassifyArgument`],
//! one implementation per target ABI; the rest of the engine only ever sees
//! the resulting `LocationKind`.
use crate::{
    runtime::Runtime,
    types::{
        layout::{FloatKind, ValueLayout, ValueShape},
        MethodDesc, TypeDesc,
    },
    utils::slots_for_bytes,
    value::StackObject,
    vm::{error::TypeResolutionError, method_info::ArgDesc},
};
use enum_dispatch::enum_dispatch;

/// Sizes of inline value types with a dedicated copy routine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StructBand {
    S12,
    S16,
    S20,
    S24,
    S28,
    S32,
    /// Any other size, moved with a length-driven copy.
    Sized(u32),
}

impl StructBand {
    pub fn for_size(size: u32) -> Self {
        match size {
            12 => StructBand::S12,
            16 => StructBand::S16,
            20 => StructBand::S20,
            24 => StructBand::S24,
            28 => StructBand::S28,
            32 => StructBand::S32,
            n => StructBand::Sized(n),
        }
    }

    pub fn size(self) -> u32 {
        match self {
            StructBand::S12 => 12,
            StructBand::S16 => 16,
            StructBand::S20 => 20,
            StructBand::S24 => 24,
            StructBand::S28 => 28,
            StructBand::S32 => 32,
            StructBand::Sized(n) => n,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocationKind {
    /// Small integers, sign or zero extended to a full slot.
    I1,
    U1,
    I2,
    U2,
    /// Anything that fits one slot as is.
    Scalar,
    /// Value type stored inline across several slots.
    Struct(StructBand),
    /// Homogeneous float aggregate, inline.
    Hfa { float: FloatKind, count: u8 },
    /// Value type passed by hidden pointer; the size is that of the pointee.
    Indirect(u32),
}

impl LocationKind {
    /// Bytes of the value itself.
    pub fn value_size(self) -> u32 {
        match self {
            LocationKind::I1 | LocationKind::U1 => 1,
            LocationKind::I2 | LocationKind::U2 => 2,
            LocationKind::Scalar => 8,
            LocationKind::Struct(band) => band.size(),
            LocationKind::Hfa { float, count } => float.size() * count as u32,
            LocationKind::Indirect(size) => size,
        }
    }

    /// Slots the value takes inside a frame, where it is always stored inline.
    pub fn frame_slots(self) -> usize {
        match self {
            LocationKind::Struct(_) | LocationKind::Hfa { .. } | LocationKind::Indirect(_) => {
                slots_for_bytes(self.value_size() as usize)
            }
            _ => 1,
        }
    }

    /// Whether a host-supplied slot must be rewritten on its way into a frame.
    pub fn needs_fixup(self) -> bool {
        matches!(
            self,
            LocationKind::I1
                | LocationKind::U1
                | LocationKind::I2
                | LocationKind::U2
                | LocationKind::Indirect(_)
        )
    }

    /// Sign or zero extends a small integer to the full slot width.
    pub fn widen(self, v: StackObject) -> StackObject {
        match self {
            LocationKind::I1 => StackObject::from_i32(v.0 as u8 as i8 as i32),
            LocationKind::U1 => StackObject::from_i32(v.0 as u8 as i32),
            LocationKind::I2 => StackObject::from_i32(v.0 as u16 as i16 as i32),
            LocationKind::U2 => StackObject::from_i32(v.0 as u16 as i32),
            _ => v,
        }
    }
}

#[enum_dispatch]
pub trait ClassifyArgument {
    /// Classifies a value type by its layout.
    fn classify_value(&self, layout: &ValueLayout) -> LocationKind;
}

/// System V AMD64: value types are always copied inline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SysV64;

/// AAPCS64: HFAs travel in float registers, aggregates above 16 bytes by reference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Aarch64;

/// Microsoft x64: only 1, 2, 4 and 8 byte aggregates are passed by value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Win64;

impl ClassifyArgument for SysV64 {
    fn classify_value(&self, layout: &ValueLayout) -> LocationKind {
        if layout.size <= 8 {
            LocationKind::Scalar
        } else {
            LocationKind::Struct(StructBand::for_size(layout.size))
        }
    }
}

impl ClassifyArgument for Aarch64 {
    fn classify_value(&self, layout: &ValueLayout) -> LocationKind {
        if let Some((float, count)) = layout.homogeneous_float() {
            return LocationKind::Hfa { float, count };
        }
        match layout.size {
            0..=8 => LocationKind::Scalar,
            9..=16 => LocationKind::Struct(StructBand::for_size(layout.size)),
            n => LocationKind::Indirect(n),
        }
    }
}

impl ClassifyArgument for Win64 {
    fn classify_value(&self, layout: &ValueLayout) -> LocationKind {
        match layout.size {
            1 | 2 | 4 | 8 => LocationKind::Scalar,
            n => LocationKind::Indirect(n),
        }
    }
}

#[enum_dispatch(ClassifyArgument)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetAbi {
    SysV64,
    Aarch64,
    Win64,
}

impl TargetAbi {
    pub fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            TargetAbi::Aarch64(Aarch64)
        } else if cfg!(all(windows, target_pointer_width = "64")) {
            TargetAbi::Win64(Win64)
        } else {
            TargetAbi::SysV64(SysV64)
        }
    }

    pub fn classify(&self, ty: TypeDesc, layout: &ValueLayout) -> LocationKind {
        match (ty, &layout.shape) {
            (TypeDesc::I1, _) => LocationKind::I1,
            (TypeDesc::Bool | TypeDesc::U1, _) => LocationKind::U1,
            (TypeDesc::I2, _) => LocationKind::I2,
            (TypeDesc::Char | TypeDesc::U2, _) => LocationKind::U2,
            (TypeDesc::Value(_), ValueShape::Aggregate(_)) => self.classify_value(layout),
            _ => LocationKind::Scalar,
        }
    }
}

/// Fixed-length copy; one instantiation per band.
#[inline]
fn copy_fixed<const N: usize>(src: &[u8], dst: &mut [u8]) {
    dst[..N].copy_from_slice(&src[..N]);
}

/// Copies one value of `kind` between byte buffers.
pub fn copy_value(kind: LocationKind, src: &[u8], dst: &mut [u8]) {
    match kind {
        LocationKind::Struct(StructBand::S12) => copy_fixed::<12>(src, dst),
        LocationKind::Struct(StructBand::S16) => copy_fixed::<16>(src, dst),
        LocationKind::Struct(StructBand::S20) => copy_fixed::<20>(src, dst),
        LocationKind::Struct(StructBand::S24) => copy_fixed::<24>(src, dst),
        LocationKind::Struct(StructBand::S28) => copy_fixed::<28>(src, dst),
        LocationKind::Struct(StructBand::S32) => copy_fixed::<32>(src, dst),
        other => {
            let n = other.value_size() as usize;
            dst[..n].copy_from_slice(&src[..n]);
        }
    }
}

pub fn describe_type(rt: &Runtime, abi: TargetAbi, ty: TypeDesc) -> Result<ArgDesc, TypeResolutionError> {
    let layout = rt.value_layout(ty)?;
    let kind = abi.classify(ty, &layout);
    Ok(ArgDesc {
        kind,
        ty,
        slots: kind.frame_slots() as u16,
    })
}

/// Classifies every argument of `method`, `this` first.
pub fn describe_args(rt: &Runtime, abi: TargetAbi, method: &MethodDesc) -> Result<Vec<ArgDesc>, TypeResolutionError> {
    method.arg_types().map(|ty| describe_type(rt, abi, ty)).collect()
}

/// Host arguments can be block-copied into a frame when no argument needs
/// widening or dereferencing on the way.
pub fn is_trivial_copy(args: &[ArgDesc]) -> bool {
    args.iter().all(|a| !a.kind.needs_fixup())
}
