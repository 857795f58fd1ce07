use crate::{
    types::{ClassHandle, MethodHandle},
    value::ObjectRef,
};

/// One frame of a captured managed stack trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackTraceEntry {
    pub method: String,
    pub offset: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExceptionDetails {
    pub message: Option<String>,
    /// Innermost frame first. Filled in the first time the exception is raised.
    pub stack_trace: Vec<StackTraceEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayShape {
    pub lengths: Vec<u32>,
    /// Empty for zero-based vectors.
    pub lower_bounds: Vec<i32>,
    pub element_size: u32,
}

impl ArrayShape {
    pub fn vector(length: u32, element_size: u32) -> Self {
        Self {
            lengths: vec![length],
            lower_bounds: vec![],
            element_size,
        }
    }

    pub fn rank(&self) -> usize {
        self.lengths.len()
    }

    pub fn total_len(&self) -> usize {
        self.lengths.iter().map(|&l| l as usize).product()
    }

    pub fn lower_bound(&self, dim: usize) -> i32 {
        self.lower_bounds.get(dim).copied().unwrap_or(0)
    }

    /// Row-major flat index of a multi-dimensional position, or `None` if any
    /// index falls outside its dimension.
    pub fn flat_index(&self, indices: &[i32]) -> Option<usize> {
        if indices.len() != self.rank() {
            return None;
        }
        let mut flat = 0usize;
        for (dim, &index) in indices.iter().enumerate() {
            let rel = index as i64 - self.lower_bound(dim) as i64;
            let len = self.lengths[dim] as i64;
            if rel < 0 || rel >= len {
                return None;
            }
            flat = flat * len as usize + rel as usize;
        }
        Some(flat)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DelegateData {
    pub target: Option<ObjectRef>,
    pub method: MethodHandle,
    /// Combined delegates, in registration order. Empty for a single-cast delegate.
    pub invocation_list: Vec<ObjectRef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// Class instance or boxed value type; fields live in `data`.
    Instance,
    Exception(Box<ExceptionDetails>),
    Array(ArrayShape),
    String(Box<str>),
    Delegate(DelegateData),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapObject {
    pub class: ClassHandle,
    pub data: Box<[u8]>,
    pub kind: ObjectKind,
}

impl HeapObject {
    pub fn array_shape(&self) -> Option<&ArrayShape> {
        match &self.kind {
            ObjectKind::Array(shape) => Some(shape),
            _ => None,
        }
    }

    pub fn delegate(&self) -> Option<&DelegateData> {
        match &self.kind {
            ObjectKind::Delegate(d) => Some(d),
            _ => None,
        }
    }

    pub fn exception(&self) -> Option<&ExceptionDetails> {
        match &self.kind {
            ObjectKind::Exception(d) => Some(d),
            _ => None,
        }
    }

    pub fn exception_mut(&mut self) -> Option<&mut ExceptionDetails> {
        match &mut self.kind {
            ObjectKind::Exception(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ObjectKind::String(s) => Some(s),
            _ => None,
        }
    }
}
