use crate::{
    utils::SLOT_SIZE,
    value::{Address, ObjectRef, StackObject},
    vm::{
        context::ExecContext,
        error::Fault,
        instructions::misrouted,
        opcodes::Instruction as I,
        StepResult,
    },
};
use std::sync::atomic::{fence, Ordering};

pub fn execute(ctx: &mut ExecContext, instr: I) -> Result<StepResult, Fault> {
    match instr {
        I::Nop {} => {}
        I::InitLocals { base, count } => {
            let at = ctx.byte_offset(base)?;
            ctx.machine().bytes_mut(at, count as usize * SLOT_SIZE)?.fill(0);
        }

        I::MovI1 { dst, src } => {
            let v: i8 = ctx.slot(src)?;
            ctx.set_slot(dst, v as i32)?;
        }
        I::MovU1 { dst, src } => {
            let v: u8 = ctx.slot(src)?;
            ctx.set_slot(dst, v as i32)?;
        }
        I::MovI2 { dst, src } => {
            let v: i16 = ctx.slot(src)?;
            ctx.set_slot(dst, v as i32)?;
        }
        I::MovU2 { dst, src } => {
            let v: u16 = ctx.slot(src)?;
            ctx.set_slot(dst, v as i32)?;
        }
        I::Mov4 { dst, src } => {
            let v: u32 = ctx.slot(src)?;
            ctx.set_slot(dst, v)?;
        }
        I::Mov8 { dst, src } => {
            let v = ctx.get(src)?;
            ctx.set(dst, v)?;
        }
        I::MovN { dst, src, size } => {
            let bytes = ctx.slot_bytes(src, size as usize)?;
            ctx.set_slot_bytes(dst, &bytes)?;
        }

        I::LdcI4 { dst, value } => ctx.set_slot(dst, value)?,
        I::LdcI8 { dst, value } => ctx.set_slot(dst, value)?,
        I::LdcR4 { dst, value } => ctx.set_slot(dst, value)?,
        I::LdcR8 { dst, value } => ctx.set_slot(dst, value)?,
        I::Ldnull { dst } => ctx.set(dst, StackObject::ZERO)?,
        I::LdlocAddr { dst, src } => {
            let addr = ctx.slot_address(src)?;
            ctx.set(dst, StackObject::from_address(Some(addr)))?;
        }

        I::LdindI1 { dst, addr } => {
            let a = ctx.address(addr)?;
            let v: i8 = ctx.memory().read(a)?;
            ctx.set_slot(dst, v as i32)?;
        }
        I::LdindU1 { dst, addr } => {
            let a = ctx.address(addr)?;
            let v: u8 = ctx.memory().read(a)?;
            ctx.set_slot(dst, v as i32)?;
        }
        I::LdindI2 { dst, addr } => {
            let a = ctx.address(addr)?;
            let v: i16 = ctx.memory().read(a)?;
            ctx.set_slot(dst, v as i32)?;
        }
        I::LdindU2 { dst, addr } => {
            let a = ctx.address(addr)?;
            let v: u16 = ctx.memory().read(a)?;
            ctx.set_slot(dst, v as i32)?;
        }
        I::LdindI4 { dst, addr } => {
            let a = ctx.address(addr)?;
            let v: i32 = ctx.memory().read(a)?;
            ctx.set_slot(dst, v)?;
        }
        I::LdindI8 { dst, addr } => {
            let a = ctx.address(addr)?;
            let v: u64 = ctx.memory().read(a)?;
            ctx.set(dst, StackObject(v))?;
        }

        I::StindI1 { addr, src } => {
            let a = ctx.address(addr)?;
            let v: i8 = ctx.slot(src)?;
            ctx.memory().write(a, v)?;
        }
        I::StindI2 { addr, src } => {
            let a = ctx.address(addr)?;
            let v: i16 = ctx.slot(src)?;
            ctx.memory().write(a, v)?;
        }
        I::StindI4 { addr, src } => {
            let a = ctx.address(addr)?;
            let v: i32 = ctx.slot(src)?;
            ctx.memory().write(a, v)?;
        }
        I::StindI8 { addr, src } => {
            let a = ctx.address(addr)?;
            let v: u64 = ctx.slot(src)?;
            ctx.memory().write(a, v)?;
        }
        I::StindRef { addr, src } => {
            let a = ctx.address(addr)?;
            let v: Option<ObjectRef> = ctx.slot(src)?;
            ctx.memory().write_ref(a, v)?;
        }

        I::LdobjN { dst, addr, size } => {
            let a = ctx.address(addr)?;
            let mut bytes = vec![0u8; size as usize];
            ctx.memory().read_bytes(a, &mut bytes)?;
            ctx.set_slot_bytes(dst, &bytes)?;
        }
        I::StobjN { addr, src, size } => {
            let a = ctx.address(addr)?;
            let bytes = ctx.slot_bytes(src, size as usize)?;
            ctx.memory().write_bytes(a, &bytes, true)?;
        }
        I::InitobjN { addr, size } => {
            let a = ctx.address(addr)?;
            ctx.memory().fill(a, 0, size as usize)?;
        }
        I::CpobjN { dst, src, size } => {
            let d = ctx.address(dst)?;
            let s = ctx.address(src)?;
            ctx.memory().copy(d, s, size as usize, true)?;
        }

        I::Localloc { dst, size } => {
            let n: u32 = ctx.slot(size)?;
            let offset = ctx.machine().alloc_local(n as usize)?;
            ctx.set(dst, StackObject::from_address(Some(Address::LocalAlloc(offset))))?;
        }
        I::Initblk { addr, value, size } => {
            let a = ctx.address(addr)?;
            let v: u8 = ctx.slot(value)?;
            let n: u32 = ctx.slot(size)?;
            ctx.memory().fill(a, v, n as usize)?;
        }
        I::Cpblk { dst, src, size } => {
            let d = ctx.address(dst)?;
            let s = ctx.address(src)?;
            let n: u32 = ctx.slot(size)?;
            ctx.memory().copy(d, s, n as usize, false)?;
        }
        I::MemoryBarrier {} => fence(Ordering::SeqCst),
        _ => return Err(misrouted(ctx, instr)),
    }
    Ok(StepResult::Continue)
}

