//! Buffered execution tracer for the interpreter.
//!
//! The dispatch loop builds [`TraceEvent`]s only when tracing is on and the
//! event's level passes the filter. Events travel over a bounded channel to a
//! writer thread that renders them as indented text or one JSON object per
//! line.
//!
//! ## Environment Variables
//!
//! - `HYBRID_INTERP_TRACE`: `"1"`, `"true"` or `"stdout"` for stdout, `"stderr"`, or a file path
//! - `HYBRID_INTERP_TRACE_LEVEL`: `error`, `info`, `debug`, `trace` or `instruction` (default)
//! - `HYBRID_INTERP_TRACE_FORMAT`: `text` (default) or `json`
//! - `HYBRID_INTERP_TRACE_STATS`: count events per kind (`"1"` or `"true"`)
//! - `HYBRID_INTERP_TRACE_FLUSH_INTERVAL`: records between automatic flushes (default: 10000)
//!
//! ```bash
//! HYBRID_INTERP_TRACE=/tmp/trace.log HYBRID_INTERP_TRACE_LEVEL=trace hybrid-interp run fib --arg 10
//! ```
use crate::config::TraceConfig;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::File,
    io::{self, stderr, stdout, BufWriter, Write},
    str::FromStr,
    thread::{self, JoinHandle},
    time::{SystemTime, UNIX_EPOCH},
};

const BUFFER_SIZE: usize = 256 * 1024;
const CHANNEL_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Error = 0,
    Info = 1,
    Debug = 2,
    Trace = 3,
    Instruction = 4,
}

impl FromStr for TraceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            "instruction" => Ok(Self::Instruction),
            other => Err(format!("unknown trace level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    Text,
    Json,
}

impl FromStr for TraceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown trace format '{other}'")),
        }
    }
}

/// Something the interpreter did that is worth a trace line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    /// An interpreted frame was pushed at slot `base`.
    Enter {
        method: String,
        args: u16,
        locals: u16,
        frame_slots: u16,
        base: usize,
    },
    Leave {
        method: String,
    },
    Instruction {
        ip: usize,
        text: String,
    },
    Branch {
        opcode: &'static str,
        target: usize,
        taken: bool,
    },
    Exception {
        exception: String,
        method: String,
        ip: usize,
    },
    /// Control moved into a catch, filter, finally or fault block.
    Handler {
        kind: &'static str,
        method: String,
        ip: usize,
    },
    Frame {
        depth: usize,
        method: String,
        ip: usize,
        base: usize,
        top: usize,
    },
    Message {
        level: TraceLevel,
        text: String,
    },
}

impl TraceEvent {
    pub fn level(&self) -> TraceLevel {
        match self {
            TraceEvent::Instruction { .. } | TraceEvent::Branch { .. } => TraceLevel::Instruction,
            TraceEvent::Enter { .. } | TraceEvent::Leave { .. } | TraceEvent::Handler { .. } => {
                TraceLevel::Trace
            }
            TraceEvent::Frame { .. } => TraceLevel::Debug,
            TraceEvent::Exception { .. } => TraceLevel::Info,
            TraceEvent::Message { level, .. } => *level,
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::Enter {
                method,
                args,
                locals,
                frame_slots,
                base,
            } => write!(
                f,
                "→ CALL {method} (args {args}, locals {locals}, {frame_slots} slots at {base})"
            ),
            TraceEvent::Leave { method } => write!(f, "← RET  {method}"),
            TraceEvent::Instruction { ip, text } => write!(f, "[IL_{ip:04x}] {text}"),
            TraceEvent::Branch { opcode, target, taken } => {
                let status = if *taken { "taken" } else { "not taken" };
                write!(f, "↷ {opcode} to IL_{target:04x} ({status})")
            }
            TraceEvent::Exception { exception, method, ip } => {
                write!(f, "⚠ EXC  {exception} at {method} IL_{ip:04x}")
            }
            TraceEvent::Handler { kind, method, ip } => {
                write!(f, "⇢ {kind} in {method} at IL_{ip:04x}")
            }
            TraceEvent::Frame {
                depth,
                method,
                ip,
                base,
                top,
            } => write!(f, "║ FRAME #{depth} {method} IL_{ip:04x} base={base} top={top}"),
            TraceEvent::Message { text, .. } => f.write_str(text),
        }
    }
}

#[derive(Debug, Serialize)]
struct TraceRecord {
    depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread: Option<String>,
    timestamp_us: u64,
    #[serde(flatten)]
    event: TraceEvent,
}

enum Command {
    Record(TraceRecord),
    Flush,
    Shutdown,
}

/// Per-kind event counts, kept when statistics are switched on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceStats {
    pub messages: usize,
    pub instructions: usize,
    pub calls: usize,
    pub returns: usize,
    pub exceptions: usize,
    pub handlers: usize,
    pub branches: usize,
}

impl TraceStats {
    fn record(&mut self, event: &TraceEvent) {
        let counter = match event {
            TraceEvent::Instruction { .. } => &mut self.instructions,
            TraceEvent::Enter { .. } => &mut self.calls,
            TraceEvent::Leave { .. } => &mut self.returns,
            TraceEvent::Exception { .. } => &mut self.exceptions,
            TraceEvent::Handler { .. } => &mut self.handlers,
            TraceEvent::Branch { .. } => &mut self.branches,
            TraceEvent::Frame { .. } | TraceEvent::Message { .. } => &mut self.messages,
        };
        *counter += 1;
    }
}

impl fmt::Display for TraceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== trace statistics ===")?;
        for (name, n) in [
            ("instructions", self.instructions),
            ("calls", self.calls),
            ("returns", self.returns),
            ("branches", self.branches),
            ("exceptions", self.exceptions),
            ("handlers", self.handlers),
            ("messages", self.messages),
        ] {
            writeln!(f, "{name:<14}{n:>12}")?;
        }
        Ok(())
    }
}

struct TraceWriter {
    out: BufWriter<Box<dyn Write + Send>>,
    format: TraceFormat,
    flush_interval: usize,
    since_flush: usize,
}

impl TraceWriter {
    fn write(&mut self, record: &TraceRecord) -> io::Result<()> {
        match self.format {
            TraceFormat::Text => {
                for _ in 0..record.depth {
                    self.out.write_all(b"  ")?;
                }
                writeln!(self.out, "{}", record.event)?;
            }
            TraceFormat::Json => {
                serde_json::to_writer(&mut self.out, record)?;
                self.out.write_all(b"\n")?;
            }
        }
        self.since_flush += 1;
        if self.since_flush >= self.flush_interval {
            self.since_flush = 0;
            self.out.flush()?;
        }
        Ok(())
    }

    fn run(mut self, rx: Receiver<Command>) {
        while let Ok(command) = rx.recv() {
            let result = match command {
                Command::Record(record) => self.write(&record),
                Command::Flush => {
                    self.since_flush = 0;
                    self.out.flush()
                }
                Command::Shutdown => break,
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "trace writer stopped");
                return;
            }
        }
        let _ = self.out.flush();
    }
}

fn open_sink(destination: &str) -> Option<Box<dyn Write + Send>> {
    match destination {
        "stdout" => Some(Box::new(stdout())),
        "stderr" => Some(Box::new(stderr())),
        path => match File::create(path) {
            Ok(f) => Some(Box::new(f)),
            Err(e) => {
                tracing::warn!(path, error = %e, "failed to create trace file");
                None
            }
        },
    }
}

fn timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as u64)
}

pub struct Tracer {
    sender: Option<Sender<Command>>,
    writer: Option<JoinHandle<()>>,
    min_level: TraceLevel,
    stats: Option<TraceStats>,
    sent: usize,
}

impl Tracer {
    pub fn disabled() -> Self {
        Self {
            sender: None,
            writer: None,
            min_level: TraceLevel::Error,
            stats: None,
            sent: 0,
        }
    }

    /// Starts the writer thread for `config`, or returns a disabled tracer
    /// when there is no destination or it cannot be opened.
    pub fn new(config: &TraceConfig) -> Self {
        let Some(sink) = config.destination.as_deref().and_then(open_sink) else {
            return Self::disabled();
        };
        let (tx, rx) = bounded(CHANNEL_CAPACITY);
        let writer = TraceWriter {
            out: BufWriter::with_capacity(BUFFER_SIZE, sink),
            format: config.format,
            flush_interval: config.flush_interval.max(1),
            since_flush: 0,
        };
        let handle = thread::Builder::new()
            .name("interp-trace".into())
            .spawn(move || writer.run(rx));
        match handle {
            Ok(handle) => Self {
                sender: Some(tx),
                writer: Some(handle),
                min_level: config.level,
                stats: config.stats.then(TraceStats::default),
                sent: 0,
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to start trace writer");
                Self::disabled()
            }
        }
    }

    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    #[inline(always)]
    pub fn wants(&self, level: TraceLevel) -> bool {
        self.is_enabled() && level <= self.min_level
    }

    pub fn emit(&mut self, depth: usize, event: TraceEvent) {
        if !self.wants(event.level()) {
            return;
        }
        if let Some(stats) = &mut self.stats {
            stats.record(&event);
        }
        let record = TraceRecord {
            depth,
            thread: thread::current().name().map(str::to_string),
            timestamp_us: timestamp_us(),
            event,
        };
        if let Some(sender) = &self.sender {
            // blocking send: a lagging sink slows execution instead of dropping lines
            if sender.send(Command::Record(record)).is_ok() {
                self.sent += 1;
            }
        }
    }

    pub fn msg(&mut self, level: TraceLevel, depth: usize, args: fmt::Arguments) {
        if self.wants(level) {
            self.emit(
                depth,
                TraceEvent::Message {
                    level,
                    text: args.to_string(),
                },
            );
        }
    }

    pub fn flush(&mut self) {
        if let Some(sender) = &self.sender {
            let _ = sender.try_send(Command::Flush);
        }
    }

    /// Records handed to the writer so far.
    pub fn records_sent(&self) -> usize {
        self.sent
    }

    /// `None` unless statistics were requested.
    pub fn stats(&self) -> Option<&TraceStats> {
        self.stats.as_ref()
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Command::Shutdown);
        }
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_trace(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("hybrid-interp-{name}-{}.log", std::process::id()))
    }

    #[test]
    fn levels_parse_and_order() {
        assert!(TraceLevel::Error < TraceLevel::Instruction);
        assert_eq!("DEBUG".parse(), Ok(TraceLevel::Debug));
        assert!("verbose".parse::<TraceLevel>().is_err());
        assert_eq!("json".parse(), Ok(TraceFormat::Json));
    }

    #[test]
    fn text_trace_respects_level() {
        let path = temp_trace("text");
        let config = TraceConfig {
            destination: Some(path.display().to_string()),
            level: TraceLevel::Trace,
            stats: true,
            ..Default::default()
        };
        {
            let mut tracer = Tracer::new(&config);
            assert!(tracer.is_enabled());
            assert!(!tracer.wants(TraceLevel::Instruction));
            tracer.emit(
                0,
                TraceEvent::Enter {
                    method: "Demo::Main".into(),
                    args: 1,
                    locals: 2,
                    frame_slots: 8,
                    base: 0,
                },
            );
            tracer.emit(
                1,
                TraceEvent::Instruction {
                    ip: 4,
                    text: "AddI4".into(),
                },
            );
            tracer.emit(
                0,
                TraceEvent::Leave {
                    method: "Demo::Main".into(),
                },
            );
            let stats = tracer.stats().unwrap();
            assert_eq!((stats.calls, stats.returns, stats.instructions), (1, 1, 0));
            assert_eq!(tracer.records_sent(), 2);
        }
        let written = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert!(written.contains("→ CALL Demo::Main (args 1, locals 2, 8 slots at 0)"));
        assert!(!written.contains("AddI4"));
        assert!(written.contains("← RET  Demo::Main"));
    }

    #[test]
    fn json_records_carry_the_event_tag() {
        let path = temp_trace("json");
        let config = TraceConfig {
            destination: Some(path.display().to_string()),
            format: TraceFormat::Json,
            ..Default::default()
        };
        {
            let mut tracer = Tracer::new(&config);
            tracer.emit(
                3,
                TraceEvent::Branch {
                    opcode: "BrTrueI4",
                    target: 0x10,
                    taken: true,
                },
            );
        }
        let written = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        let line: serde_json::Value = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(line["event"], "branch");
        assert_eq!(line["opcode"], "BrTrueI4");
        assert_eq!(line["depth"], 3);
        assert_eq!(line["taken"], true);
    }

    #[test]
    fn disabled_tracer_drops_everything() {
        let mut tracer = Tracer::disabled();
        tracer.msg(TraceLevel::Error, 0, format_args!("lost"));
        assert!(!tracer.wants(TraceLevel::Error));
        assert_eq!(tracer.records_sent(), 0);
        assert!(tracer.stats().is_none());
    }
}
