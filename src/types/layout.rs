use crate::utils::align_up;

/// Assigns natural-alignment offsets to a sequence of `(size, align)` fields
/// starting at `start`. Returns the offsets, the end offset and the largest alignment.
pub fn place_fields(start: u32, fields: &[(u32, u32)]) -> (Vec<u32>, u32, u32) {
    let mut cursor = start as usize;
    let mut max_align = 1;
    let mut offsets = Vec::with_capacity(fields.len());
    for &(size, align) in fields {
        cursor = align_up(cursor, align as usize);
        offsets.push(cursor as u32);
        cursor += size as usize;
        max_align = max_align.max(align);
    }
    (offsets, cursor as u32, max_align)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FloatKind {
    F32,
    F64,
}

impl FloatKind {
    pub fn size(self) -> u32 {
        match self {
            FloatKind::F32 => 4,
            FloatKind::F64 => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarClass {
    Int { size: u8, signed: bool },
    Float(FloatKind),
    Pointer,
}

/// A scalar leaf of a flattened value type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafField {
    pub offset: u32,
    pub class: ScalarClass,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueShape {
    Scalar(ScalarClass),
    /// Value type flattened to its scalar leaves, nested structs included.
    Aggregate(Vec<LeafField>),
}

/// Everything an ABI classifier needs to know about a parameter type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueLayout {
    pub size: u32,
    pub align: u32,
    pub shape: ValueShape,
}

impl ValueLayout {
    pub fn scalar(size: u32, class: ScalarClass) -> Self {
        Self {
            size,
            align: size.max(1),
            shape: ValueShape::Scalar(class),
        }
    }

    /// Element kind and count if this is an aggregate of one to four floats
    /// of the same width.
    pub fn homogeneous_float(&self) -> Option<(FloatKind, u8)> {
        let ValueShape::Aggregate(leaves) = &self.shape else {
            return None;
        };
        let first = match leaves.first()?.class {
            ScalarClass::Float(k) => k,
            _ => return None,
        };
        let uniform = leaves
            .iter()
            .all(|l| l.class == ScalarClass::Float(first));
        let count = leaves.len();
        if uniform && (1..=4).contains(&count) && self.size == first.size() * count as u32 {
            Some((first, count as u8))
        } else {
            None
        }
    }
}
