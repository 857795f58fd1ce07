use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine counters shared by every thread interpreting against one runtime.
///
/// All counters use `Ordering::Relaxed`: they are independent and never used
/// to synchronize other memory.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    pub instructions_executed: AtomicU64,
    pub frames_entered: AtomicU64,
    pub native_calls: AtomicU64,
    pub foreign_calls: AtomicU64,
    pub exceptions_raised: AtomicU64,
    pub class_inits: AtomicU64,
    /// Highest evaluation stack top seen on any thread, in slots.
    pub stack_high_water: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub instructions_executed: u64,
    pub frames_entered: u64,
    pub native_calls: u64,
    pub foreign_calls: u64,
    pub exceptions_raised: u64,
    pub class_inits: u64,
    pub stack_high_water: u64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_instructions(&self, count: u64) {
        self.instructions_executed
            .fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_entered(&self) {
        self.frames_entered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_native_call(&self) {
        self.native_calls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_foreign_call(&self) {
        self.foreign_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exception(&self) {
        self.exceptions_raised.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_class_init(&self) {
        self.class_inits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stack_top(&self, slots: usize) {
        self.stack_high_water
            .fetch_max(slots as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            instructions_executed: self.instructions_executed.load(Ordering::Relaxed),
            frames_entered: self.frames_entered.load(Ordering::Relaxed),
            native_calls: self.native_calls.load(Ordering::Relaxed),
            foreign_calls: self.foreign_calls.load(Ordering::Relaxed),
            exceptions_raised: self.exceptions_raised.load(Ordering::Relaxed),
            class_inits: self.class_inits.load(Ordering::Relaxed),
            stack_high_water: self.stack_high_water.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Interpreter metrics:")?;
        writeln!(f, "  Instructions executed: {:>12}", self.instructions_executed)?;
        writeln!(f, "  Frames entered:        {:>12}", self.frames_entered)?;
        writeln!(f, "  Native calls:          {:>12}", self.native_calls)?;
        writeln!(f, "  Foreign calls:         {:>12}", self.foreign_calls)?;
        writeln!(f, "  Exceptions raised:     {:>12}", self.exceptions_raised)?;
        writeln!(f, "  Class initialisations: {:>12}", self.class_inits)?;
        write!(f, "  Stack high water:      {:>12}", self.stack_high_water)
    }
}
