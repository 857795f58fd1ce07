use crate::vm::tracer::{TraceFormat, TraceLevel};
use std::{env, fmt::Display, str::FromStr};

pub const DEFAULT_STACK_SLOTS: usize = 8 * 1024 * 1024;
pub const DEFAULT_INITIAL_STACK_SLOTS: usize = 64 * 1024;
const DEFAULT_FLUSH_INTERVAL: usize = 10_000;

/// Where and how the execution tracer writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceConfig {
    /// `stdout`, `stderr` or a file path. `None` disables tracing.
    pub destination: Option<String>,
    pub level: TraceLevel,
    pub format: TraceFormat,
    pub stats: bool,
    pub flush_interval: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            destination: None,
            level: TraceLevel::Instruction,
            format: TraceFormat::Text,
            stats: false,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Parses `name` from the environment, warning about values that do not parse.
fn env_parse<T: FromStr>(name: &str) -> Option<T>
where
    T::Err: Display,
{
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(variable = name, value = %raw, error = %e, "ignoring malformed setting");
            None
        }
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|v| v == "1" || v == "true")
}

impl TraceConfig {
    pub fn from_env() -> Self {
        let destination = env::var("HYBRID_INTERP_TRACE")
            .ok()
            .filter(|v| !v.is_empty() && v != "0" && v != "false")
            .map(|v| match v.as_str() {
                "1" | "true" => "stdout".to_string(),
                _ => v,
            });
        Self {
            destination,
            level: env_parse("HYBRID_INTERP_TRACE_LEVEL").unwrap_or(TraceLevel::Instruction),
            format: env_parse("HYBRID_INTERP_TRACE_FORMAT").unwrap_or(TraceFormat::Text),
            stats: env_flag("HYBRID_INTERP_TRACE_STATS"),
            flush_interval: env_parse("HYBRID_INTERP_TRACE_FLUSH_INTERVAL").unwrap_or(DEFAULT_FLUSH_INTERVAL),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterpreterConfig {
    /// Hard limit on evaluation stack slots per thread.
    pub stack_slots: usize,
    /// Slots reserved when a thread first runs interpreted code.
    pub initial_stack_slots: usize,
    pub trace: TraceConfig,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            stack_slots: DEFAULT_STACK_SLOTS,
            initial_stack_slots: DEFAULT_INITIAL_STACK_SLOTS,
            trace: TraceConfig::default(),
        }
    }
}

impl InterpreterConfig {
    /// Defaults overridden by `HYBRID_INTERP_*` environment variables.
    pub fn from_env() -> Self {
        let stack_slots = env_parse("HYBRID_INTERP_STACK_SLOTS").unwrap_or(DEFAULT_STACK_SLOTS);
        let initial_stack_slots = env_parse("HYBRID_INTERP_INITIAL_STACK_SLOTS")
            .unwrap_or(DEFAULT_INITIAL_STACK_SLOTS)
            .min(stack_slots);
        Self {
            stack_slots,
            initial_stack_slots,
            trace: TraceConfig::from_env(),
        }
    }

    pub fn with_stack_slots(mut self, slots: usize) -> Self {
        self.stack_slots = slots;
        self.initial_stack_slots = self.initial_stack_slots.min(slots);
        self
    }
}
