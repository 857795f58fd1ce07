//! Instruction handlers, one module per opcode family.
//!
//! Every family exposes a single `execute` that matches on the variants it
//! owns; the registry in [`opcodes`](crate::vm::opcodes) maps each opcode to
//! its family's `execute`.
use crate::vm::{
    context::ExecContext,
    error::{ExecutionError, Fault},
    opcodes::{Instruction, Opcode, HANDLERS},
    StepResult,
};

pub mod arithmetic;
pub mod arrays;
pub mod calls;
pub mod comparisons;
pub mod conversions;
pub mod exceptions;
pub mod fields;
pub mod flow;
pub mod memory;
pub mod objects;

pub type InstructionHandler = fn(&mut ExecContext<'_>, Instruction) -> Result<StepResult, Fault>;

#[inline]
pub fn get_handler(opcode: Opcode) -> InstructionHandler {
    HANDLERS[opcode as usize]
}

/// Reached when an instruction lands in a family that does not own it, which
/// means the handler table and the catalogue disagree.
pub(crate) fn misrouted(ctx: &ExecContext, instr: Instruction) -> Fault {
    ExecutionError::InvalidOpcode {
        offset: ctx.ip,
        opcode: instr.opcode() as u16,
    }
    .into()
}
