use std::time::{Duration, Instant};

use crate::asm::{op, NUM_REGS};
use crate::error::VmError;
use crate::vm::{SyscallPort, Vm};
use crate::CALL_RETURN_ADDR;

// Wall-clock checks are amortized; short enough that queue/request deadline
// tests stay within their tolerance.
const DEADLINE_CHECK_INTERVAL: u32 = 64;

pub(crate) fn run(vm: &mut Vm, timeout: Duration, port: &mut dyn SyscallPort) -> Result<(), VmError> {
    let deadline = Instant::now() + timeout;
    vm.clear_stopped();
    let mut ticks = 0u32;
    loop {
        if vm.regs.rip == CALL_RETURN_ADDR {
            return Ok(());
        }
        step(vm, deadline, timeout, port)?;
        if vm.stopped() {
            return Ok(());
        }
        ticks += 1;
        if ticks >= DEADLINE_CHECK_INTERVAL {
            ticks = 0;
            if Instant::now() >= deadline {
                return Err(VmError::Timeout(timeout.as_secs_f32()));
            }
        }
    }
}

fn reg(i: u8) -> Result<usize, VmError> {
    if (i as usize) < NUM_REGS {
        Ok(i as usize)
    } else {
        Err(VmError::exception_data("invalid register operand", i as u64))
    }
}

fn step(vm: &mut Vm, deadline: Instant, timeout: Duration, port: &mut dyn SyscallPort) -> Result<(), VmError> {
    let rip = vm.regs.rip;
    let mut insn = [0u8; 10];
    vm.mem().read(rip, &mut insn)?;

    match insn[0] {
        op::MOVI => {
            let d = reg(insn[1])?;
            vm.regs.set(d, u64::from_le_bytes(insn[2..10].try_into().unwrap()));
            vm.regs.rip = rip + 10;
        }
        op::MOV | op::ADD | op::SUB => {
            let d = reg(insn[1])?;
            let s = reg(insn[2])?;
            let sv = vm.regs.get(s);
            let dv = vm.regs.get(d);
            let out = match insn[0] {
                op::MOV => sv,
                op::ADD => dv.wrapping_add(sv),
                _ => dv.wrapping_sub(sv),
            };
            vm.regs.set(d, out);
            vm.regs.rip = rip + 3;
        }
        op::ADDI | op::MULI | op::DIVI | op::MODI => {
            let d = reg(insn[1])?;
            let imm = i32::from_le_bytes(insn[2..6].try_into().unwrap());
            let dv = vm.regs.get(d);
            let out = match insn[0] {
                op::ADDI => dv.wrapping_add(imm as i64 as u64),
                op::MULI => dv.wrapping_mul(imm as u32 as u64),
                op::DIVI | op::MODI => {
                    let divisor = imm as u32 as u64;
                    if divisor == 0 {
                        return Err(VmError::exception("division by zero"));
                    }
                    if insn[0] == op::DIVI {
                        dv / divisor
                    } else {
                        dv % divisor
                    }
                }
                _ => unreachable!(),
            };
            vm.regs.set(d, out);
            vm.regs.rip = rip + 6;
        }
        op::LD | op::LDW | op::LDB => {
            let d = reg(insn[1])?;
            let base = vm.regs.get(reg(insn[2])?);
            let off = i16::from_le_bytes(insn[3..5].try_into().unwrap());
            let addr = base.wrapping_add(off as i64 as u64);
            let v = match insn[0] {
                op::LD => vm.mem().read_u64(addr)?,
                op::LDW => vm.mem().read_u32(addr)? as u64,
                _ => vm.mem().read_u8(addr)? as u64,
            };
            vm.regs.set(d, v);
            vm.regs.rip = rip + 5;
        }
        op::ST | op::STW | op::STB => {
            let base = vm.regs.get(reg(insn[1])?);
            let v = vm.regs.get(reg(insn[2])?);
            let off = i16::from_le_bytes(insn[3..5].try_into().unwrap());
            let addr = base.wrapping_add(off as i64 as u64);
            match insn[0] {
                op::ST => vm.mem_mut().write_u64(addr, v)?,
                op::STW => vm.mem_mut().write_u32(addr, v as u32)?,
                _ => vm.mem_mut().write(addr, &[v as u8])?,
            }
            vm.regs.rip = rip + 5;
        }
        op::JMP => {
            let rel = i32::from_le_bytes(insn[1..5].try_into().unwrap());
            vm.regs.rip = (rip + 5).wrapping_add(rel as i64 as u64);
        }
        op::JNZ | op::JZ => {
            let c = vm.regs.get(reg(insn[1])?);
            let rel = i32::from_le_bytes(insn[2..6].try_into().unwrap());
            let next = rip + 6;
            let taken = if insn[0] == op::JNZ { c != 0 } else { c == 0 };
            vm.regs.rip = if taken { next.wrapping_add(rel as i64 as u64) } else { next };
        }
        op::JLT => {
            let a = vm.regs.get(reg(insn[1])?);
            let b = vm.regs.get(reg(insn[2])?);
            let rel = i32::from_le_bytes(insn[3..7].try_into().unwrap());
            let next = rip + 7;
            vm.regs.rip = if a < b { next.wrapping_add(rel as i64 as u64) } else { next };
        }
        op::RET => {
            let sp = vm.regs.rsp;
            let ra = vm.mem().read_u64(sp)?;
            vm.regs.rsp = sp + 8;
            vm.regs.rip = ra;
        }
        op::PAUSE => {
            let ms = u32::from_le_bytes(insn[1..5].try_into().unwrap());
            vm.regs.rip = rip + 5;
            let now = Instant::now();
            let want = Duration::from_millis(ms as u64);
            if now + want >= deadline {
                if deadline > now {
                    std::thread::sleep(deadline - now);
                }
                return Err(VmError::Timeout(timeout.as_secs_f32()));
            }
            std::thread::sleep(want);
        }
        op::SYS => {
            let nr = u32::from_le_bytes(insn[1..5].try_into().unwrap());
            // rip moves past the instruction before the host runs, so a
            // halted VM resumes at the next instruction with no fixups.
            vm.regs.rip = rip + 5;
            port.syscall(vm, nr)?;
        }
        other => {
            return Err(VmError::exception_data("invalid opcode", other as u64));
        }
    }
    Ok(())
}
