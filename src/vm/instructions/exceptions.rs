use crate::vm::{
    context::ExecContext,
    error::Fault,
    exceptions as flow,
    instructions::misrouted,
    opcodes::Instruction as I,
    StepResult,
};

pub fn execute(ctx: &mut ExecContext, instr: I) -> Result<StepResult, Fault> {
    match instr {
        I::Throw { ex } => {
            let value = ctx.get(ex)?;
            flow::throw_value(ctx, value)
        }
        I::Rethrow {} => flow::rethrow(ctx),
        I::Leave { target } => flow::leave(ctx, target.0),
        I::EndFilter { value } => {
            let accepted = ctx.slot::<i32>(value)? != 0;
            flow::end_filter(ctx, accepted)
        }
        I::EndFinally {} => flow::end_finally(ctx),
        _ => Err(misrouted(ctx, instr)),
    }
}
