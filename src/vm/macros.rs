//! Trace shorthands. `$src` is anything with `tracer_enabled()`, `tracer()`
//! and `indent()`. Events are only built once the tracer has asked for them.

#[macro_export]
macro_rules! vm_log {
    ($src:expr, $level:ident, $($format:tt)*) => {
        if $src.tracer_enabled() {
            let depth = $src.indent();
            $src.tracer()
                .msg($crate::vm::tracer::TraceLevel::$level, depth, format_args!($($format)*))
        }
    };
}

#[macro_export]
macro_rules! vm_msg {
    ($src:expr, $($format:tt)*) => { $crate::vm_log!($src, Info, $($format)*) };
}

#[macro_export]
macro_rules! vm_error {
    ($src:expr, $($format:tt)*) => { $crate::vm_log!($src, Error, $($format)*) };
}

#[macro_export]
macro_rules! vm_debug {
    ($src:expr, $($format:tt)*) => { $crate::vm_log!($src, Debug, $($format)*) };
}

#[macro_export]
macro_rules! vm_trace {
    ($src:expr, $($format:tt)*) => { $crate::vm_log!($src, Trace, $($format)*) };
}

#[macro_export]
macro_rules! vm_trace_event {
    ($src:expr, $level:ident, $event:expr) => {
        if $src.tracer_enabled() && $src.tracer().wants($crate::vm::tracer::TraceLevel::$level) {
            let depth = $src.indent();
            let event = $event;
            $src.tracer().emit(depth, event);
        }
    };
}

/// `(ctx, ip, &Instruction)`
#[macro_export]
macro_rules! vm_trace_instruction {
    ($src:expr, $ip:expr, $instr:expr) => {
        $crate::vm_trace_event!(
            $src,
            Instruction,
            $crate::vm::tracer::TraceEvent::Instruction {
                ip: $ip,
                text: format!("{:?}", $instr),
            }
        )
    };
}

/// `(ctx, &InterpMethodInfo, base slot)`
#[macro_export]
macro_rules! vm_trace_method_entry {
    ($src:expr, $info:expr, $base:expr) => {
        $crate::vm_trace_event!($src, Trace, {
            let info = $info;
            $crate::vm::tracer::TraceEvent::Enter {
                method: info.name.clone(),
                args: info.arg_stack_size,
                locals: info.local_stack_size,
                frame_slots: info.max_stack_size,
                base: $base,
            }
        })
    };
}

#[macro_export]
macro_rules! vm_trace_method_exit {
    ($src:expr, $name:expr) => {
        $crate::vm_trace_event!(
            $src,
            Trace,
            $crate::vm::tracer::TraceEvent::Leave {
                method: ($name).to_string(),
            }
        )
    };
}

/// `(ctx, description, method name, ip)`
#[macro_export]
macro_rules! vm_trace_exception {
    ($src:expr, $exception:expr, $method:expr, $ip:expr) => {
        $crate::vm_trace_event!(
            $src,
            Info,
            $crate::vm::tracer::TraceEvent::Exception {
                exception: $exception,
                method: ($method).to_string(),
                ip: $ip,
            }
        )
    };
}

#[macro_export]
macro_rules! vm_trace_handler {
    ($src:expr, $kind:expr, $method:expr, $ip:expr) => {
        $crate::vm_trace_event!(
            $src,
            Trace,
            $crate::vm::tracer::TraceEvent::Handler {
                kind: $kind,
                method: ($method).to_string(),
                ip: $ip,
            }
        )
    };
}

#[macro_export]
macro_rules! vm_trace_branch {
    ($src:expr, $opcode:expr, $target:expr, $taken:expr) => {
        $crate::vm_trace_event!(
            $src,
            Instruction,
            $crate::vm::tracer::TraceEvent::Branch {
                opcode: $opcode,
                target: $target,
                taken: $taken,
            }
        )
    };
}
