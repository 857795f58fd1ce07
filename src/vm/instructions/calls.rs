use crate::vm::{
    bridge,
    context::ExecContext,
    error::Fault,
    instructions::misrouted,
    opcodes::Instruction as I,
    StepResult,
};

pub fn execute(ctx: &mut ExecContext, instr: I) -> Result<StepResult, Fault> {
    let next = ctx.ip + instr.opcode().size();
    match instr {
        // the body decides the path; the opcode only records what the
        // transformer saw
        I::CallInterpVoid { method, arg_base } | I::CallNativeVoid { method, arg_base } => {
            bridge::call_method(ctx, method, arg_base, None, next)
        }
        I::CallInterpRet { method, arg_base, ret } | I::CallNativeRet { method, arg_base, ret } => {
            bridge::call_method(ctx, method, arg_base, Some(ret), next)
        }
        I::CallVirtualVoid { method, arg_base } => {
            bridge::call_virtual(ctx, method, arg_base, None, next)
        }
        I::CallVirtualRet { method, arg_base, ret } => {
            bridge::call_virtual(ctx, method, arg_base, Some(ret), next)
        }
        I::CallIndVoid { fnptr, arg_base } => bridge::call_indirect(ctx, fnptr, arg_base, None, next),
        I::CallIndRet { fnptr, arg_base, ret } => {
            bridge::call_indirect(ctx, fnptr, arg_base, Some(ret), next)
        }
        I::CallDelegateVoid { arg_base } => bridge::call_delegate(ctx, arg_base, None, next),
        I::CallDelegateRet { arg_base, ret } => bridge::call_delegate(ctx, arg_base, Some(ret), next),
        _ => Err(misrouted(ctx, instr)),
    }
}
