use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod demos;
pub mod runtime;
pub mod types;
pub mod utils;
pub mod value;
#[macro_use]
pub mod vm;

use config::InterpreterConfig;
use runtime::Runtime;
use types::TypeDesc;
use value::StackObject;
use vm::{
    error::{ExecuteError, VmError},
    opcodes, Interpreter,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A register-based bytecode interpreter for managed methods"
)]
pub struct Args {
    /// Evaluation stack limit in 8-byte slots.
    #[arg(long, global = true, value_name = "SLOTS")]
    pub stack_slots: Option<usize>,
    /// Write an execution trace to `stdout`, `stderr` or a file.
    #[arg(long, global = true, value_name = "DEST")]
    pub trace: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the bundled demo programs.
    List,
    /// Run a demo and print its result.
    Run {
        demo: String,
        #[arg(long, allow_hyphen_values = true)]
        arg: Option<i32>,
    },
    /// Print the bytecode of every interpreted method of a demo.
    Disasm { demo: String },
}

pub fn run_cli() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = InterpreterConfig::from_env();
    if let Some(slots) = args.stack_slots {
        config = config.with_stack_slots(slots);
    }
    if let Some(dest) = args.trace {
        config.trace.destination = Some(dest);
    }

    let outcome = match args.command {
        Command::List => {
            for demo in demos::DEMOS {
                println!("{:<16} {}", demo.name, demo.about);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { demo, arg } => with_demo(&demo, |d| run_demo(config, d, arg)),
        Command::Disasm { demo } => with_demo(&demo, |d| disasm_demo(config, d)),
    };
    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

fn with_demo(
    name: &str,
    f: impl FnOnce(&demos::Demo) -> Result<ExitCode, VmError>,
) -> Result<ExitCode, VmError> {
    match demos::find(name) {
        Some(demo) => f(demo),
        None => {
            eprintln!("unknown demo '{name}'; `list` shows the available ones");
            Ok(ExitCode::from(2))
        }
    }
}

fn run_demo(config: InterpreterConfig, demo: &demos::Demo, arg: Option<i32>) -> Result<ExitCode, VmError> {
    let mut rt = Runtime::with_config(config);
    let program = demo.build(&mut rt)?;
    let rt = rt.seal();
    let ret = rt.method(program.entry)?.ret;
    let arg = arg.unwrap_or(demo.default_arg);

    let mut interp = Interpreter::new(rt.clone());
    let result = interp.call(program.entry, &[StackObject::from_i32(arg)]);
    {
        let mut tracer = interp.tracer();
        tracer.flush();
        if let Some(stats) = tracer.stats() {
            eprintln!("{stats}");
        }
    }
    tracing::debug!(metrics = ?rt.metrics().snapshot(), "run finished");

    match result {
        Ok(value) => {
            println!("{}", format_value(&rt, ret, value));
            Ok(ExitCode::SUCCESS)
        }
        Err(ExecuteError::Unhandled(ex)) => {
            eprintln!("Unhandled exception. {}", rt.describe_exception(ex));
            for frame in rt.stack_trace(ex) {
                eprintln!("   at {} (IL_{:04x})", frame.method, frame.offset);
            }
            Ok(ExitCode::FAILURE)
        }
        Err(ExecuteError::Vm(e)) => Err(e),
    }
}

fn disasm_demo(config: InterpreterConfig, demo: &demos::Demo) -> Result<ExitCode, VmError> {
    let mut rt = Runtime::with_config(config);
    let program = demo.build(&mut rt)?;
    let rt = rt.seal();
    for method in program.bodies {
        let info = rt.interp_info(method)?;
        println!(
            "{} (args {}, locals {}, max stack {})",
            info.name, info.arg_stack_size, info.local_stack_size, info.max_stack_size
        );
        print!("{}", opcodes::listing(&info.codes)?);
        for clause in info.ex_clauses.iter() {
            println!("  .try IL_{:04x}..IL_{:04x} {:?}", clause.try_begin, clause.try_end, clause.kind);
        }
        println!();
    }
    Ok(ExitCode::SUCCESS)
}

fn format_value(rt: &Runtime, ty: TypeDesc, value: StackObject) -> String {
    match ty {
        TypeDesc::Void => "(void)".to_string(),
        TypeDesc::I8 | TypeDesc::U8 | TypeDesc::IntPtr | TypeDesc::UIntPtr => value.as_i64().to_string(),
        TypeDesc::R4 => value.as_f32().to_string(),
        TypeDesc::R8 => value.as_f64().to_string(),
        TypeDesc::Bool => (value.as_i32() != 0).to_string(),
        TypeDesc::Object(_) => match value.as_ref() {
            None => "null".to_string(),
            Some(obj) => rt
                .string_value(obj)
                .unwrap_or_else(|| format!("{obj:?}")),
        },
        _ => value.as_i32().to_string(),
    }
}
