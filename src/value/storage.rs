//! Backing storage for everything interpreted code can point into besides
//! the evaluation stack: heap objects, static field blocks and thread-static
//! field blocks.
use crate::{
    types::ClassHandle,
    value::{
        object::{HeapObject, ObjectKind},
        ObjectRef,
    },
    vm::error::MemoryError,
};
use std::{cell::RefCell, collections::HashMap};

/// Storage location that just received an object reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierTarget {
    Object(ObjectRef),
    Static(ClassHandle),
    ThreadStatic(ClassHandle),
}

/// Hook run after every store of an object reference outside the evaluation
/// stack. `value` is `None` for bulk copies that may contain references.
pub trait WriteBarrier: Send + Sync {
    fn reference_stored(&self, target: BarrierTarget, value: Option<ObjectRef>);
}

pub struct NoBarrier;

impl WriteBarrier for NoBarrier {
    fn reference_stored(&self, _target: BarrierTarget, _value: Option<ObjectRef>) {}
}

/// Object table plus static field blocks. Collection policy belongs to the
/// embedding collector, so objects are only ever appended here.
#[derive(Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
    interned: HashMap<Box<str>, ObjectRef>,
    statics: Vec<Box<[u8]>>,
}

impl Heap {
    /// Appends a zeroed static field block; blocks are indexed by class handle.
    pub(crate) fn add_static_block(&mut self, size: u32) {
        self.statics.push(vec![0u8; size as usize].into_boxed_slice());
    }

    pub fn alloc(&mut self, object: HeapObject) -> ObjectRef {
        self.objects.push(object);
        ObjectRef::from_index(self.objects.len() - 1)
    }

    pub fn get(&self, r: ObjectRef) -> Result<&HeapObject, MemoryError> {
        self.objects
            .get(r.index())
            .ok_or(MemoryError::InvalidObject(ObjectRef::to_word(Some(r))))
    }

    pub fn get_mut(&mut self, r: ObjectRef) -> Result<&mut HeapObject, MemoryError> {
        self.objects
            .get_mut(r.index())
            .ok_or(MemoryError::InvalidObject(ObjectRef::to_word(Some(r))))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Returns the canonical string object for `value`, allocating it on first use.
    pub fn intern(&mut self, class: ClassHandle, value: &str) -> ObjectRef {
        if let Some(&r) = self.interned.get(value) {
            return r;
        }
        let r = self.alloc(HeapObject {
            class,
            data: Box::new([]),
            kind: ObjectKind::String(value.into()),
        });
        self.interned.insert(value.into(), r);
        r
    }

    pub fn statics(&self, class: ClassHandle) -> Result<&[u8], MemoryError> {
        self.statics
            .get(class.0 as usize)
            .map(|b| &b[..])
            .ok_or(MemoryError::AccessViolation(class.0 as u64))
    }

    pub fn statics_mut(&mut self, class: ClassHandle) -> Result<&mut [u8], MemoryError> {
        self.statics
            .get_mut(class.0 as usize)
            .map(|b| &mut b[..])
            .ok_or(MemoryError::AccessViolation(class.0 as u64))
    }
}

thread_local! {
    static THREAD_STATICS: RefCell<HashMap<(u32, ClassHandle), Box<[u8]>>> =
        RefCell::new(HashMap::new());
}

/// Runs `f` over the calling thread's thread-static block of `class`,
/// creating a zeroed block of `size` bytes on first touch.
pub fn with_thread_statics<R>(
    runtime_id: u32,
    class: ClassHandle,
    size: u32,
    f: impl FnOnce(&mut [u8]) -> R,
) -> R {
    THREAD_STATICS.with(|cell| {
        let mut map = cell.borrow_mut();
        let block = map
            .entry((runtime_id, class))
            .or_insert_with(|| vec![0u8; size as usize].into_boxed_slice());
        f(block)
    })
}
