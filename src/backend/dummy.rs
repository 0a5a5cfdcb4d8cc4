//! Host test device. Interprets scheduled kernels directly on host memory
//! through the CPU task pool, so the entire schedule/fingerprint/cache/
//! launch/sync path can be exercised on machines without a GPU driver or
//! an LLVM library. Enabled through the config file or `init_dummy()`;
//! never part of the production backend set.

use std::sync::Arc;

use nanoserde::{DeBin, SerBin};

use super::pool::{block_range, CpuPool};
use super::LaunchParam;
use crate::dtype::VarType;
use crate::error::{BackendError, ErrorStatus};
use crate::kernel::{Kernel, KernelOp, Program, ScheduledKernel, UNMASKED};
use crate::op::Op;
use crate::thread_state::ThreadState;

pub(crate) const DEVICE_KEY: &str = "dummy;w1";

pub struct DummyBackend;

impl DummyBackend {
    pub fn init() -> DummyBackend {
        crate::log::jit_log!(Info, "dummy", "using host test device");
        DummyBackend
    }

    /// "Compilation" captures the op list; the fingerprint has already been
    /// taken over the emitted text, so structurally identical kernels share
    /// one interpreted program.
    pub fn compile(&self, kernel: &ScheduledKernel) -> Result<Program, BackendError> {
        Ok(Program::Interp { ops: Arc::new(kernel.ops.clone()) })
    }

    pub fn load_artifact(&self, artifact: &[u8]) -> Result<Program, BackendError> {
        let ops: Vec<KernelOp> = DeBin::deserialize_bin(artifact).map_err(|_| {
            BackendError::new(ErrorStatus::KernelCompilation, "undecodable dummy artifact")
        })?;
        Ok(Program::Interp { ops: Arc::new(ops) })
    }

    pub fn artifact_bytes(program: &Program) -> Vec<u8> {
        match program {
            Program::Interp { ops } => SerBin::serialize_bin(ops.as_ref()),
            _ => Vec::new(),
        }
    }

    pub fn launch(
        &self,
        pool: &CpuPool,
        kernel: &Arc<Kernel>,
        ts: &mut ThreadState,
        params: Vec<LaunchParam>,
        size: u32,
        cpu_block_size: u32,
    ) -> Result<(), BackendError> {
        let kernel = kernel.clone();
        let task = pool.submit(move |workers| {
            let Program::Interp { ops } = &kernel.program else {
                return;
            };
            let blocks: Vec<(u32, u32)> = block_range(size, cpu_block_size).collect();
            workers.scope(|scope| {
                for (start, end) in blocks {
                    let ops = ops.clone();
                    let params = params.clone();
                    scope.spawn(move |_| interpret(&ops, &params, start, end));
                }
            });
        });
        ts.task = Some(task);
        Ok(())
    }
}

pub(crate) fn emit(kernel: &ScheduledKernel, entry: &str, out: &mut String) {
    use std::fmt::Write;
    let _ = writeln!(out, "// entry {entry}");
    out.push_str(&kernel.dump());
}

// ---------------------------------------------------------------------------
// Interpreter. One u64 register per slot holds the value's bit pattern;
// lanes run sequentially inside a block, blocks run on the worker pool.

fn to_f64(bits: u64, vt: VarType) -> f64 {
    match vt {
        VarType::F16 => half::f16::from_bits(bits as u16).to_f64(),
        VarType::F32 => f64::from(f32::from_bits(bits as u32)),
        VarType::F64 => f64::from_bits(bits),
        _ => {
            if vt.is_signed() {
                to_i64(bits, vt) as f64
            } else {
                bits as f64
            }
        }
    }
}

fn from_f64(x: f64, vt: VarType) -> u64 {
    match vt {
        VarType::F16 => u64::from(half::f16::from_f64(x).to_bits()),
        VarType::F32 => u64::from((x as f32).to_bits()),
        VarType::F64 => x.to_bits(),
        VarType::Bool => u64::from(x != 0.0),
        _ => {
            if vt.is_signed() {
                (x as i64) as u64 & mask_of(vt)
            } else {
                (x as u64) & mask_of(vt)
            }
        }
    }
}

/// Sign-extended integer view of a register.
fn to_i64(bits: u64, vt: VarType) -> i64 {
    match vt.byte_size() {
        1 => i64::from(bits as u8 as i8),
        2 => i64::from(bits as u16 as i16),
        4 => i64::from(bits as u32 as i32),
        _ => bits as i64,
    }
}

const fn mask_of(vt: VarType) -> u64 {
    match vt.byte_size() {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

fn eval_unary(op: Op, vt: VarType, src_vt: VarType, x: u64) -> u64 {
    if vt.is_float() && op != Op::Bitcast && op != Op::Cast {
        let v = to_f64(x, vt);
        let r = match op {
            Op::Neg => -v,
            Op::Sqrt => v.sqrt(),
            Op::Abs => v.abs(),
            Op::Ceil => v.ceil(),
            Op::Floor => v.floor(),
            Op::Round => v.round_ties_even(),
            Op::Trunc => v.trunc(),
            Op::Rcp => 1.0 / v,
            Op::Rsqrt => 1.0 / v.sqrt(),
            Op::Sin => v.sin(),
            Op::Cos => v.cos(),
            Op::Exp2 => v.exp2(),
            Op::Log2 => v.log2(),
            _ => v,
        };
        return from_f64(r, vt);
    }
    match op {
        Op::Neg => (to_i64(x, vt).wrapping_neg() as u64) & mask_of(vt),
        Op::Not => !x & mask_of(vt),
        Op::Abs => (to_i64(x, vt).wrapping_abs() as u64) & mask_of(vt),
        Op::Popc => u64::from((x & mask_of(vt)).count_ones()),
        Op::Clz => {
            let width = vt.byte_size() as u32 * 8;
            u64::from((x & mask_of(vt)).leading_zeros().saturating_sub(64 - width))
        }
        Op::Ctz => {
            let width = vt.byte_size() as u32 * 8;
            u64::from(((x & mask_of(vt)).trailing_zeros()).min(width))
        }
        Op::Cast => {
            // numeric conversion from the source register's type
            if vt.is_float() || src_vt.is_float() {
                from_f64(to_f64(x, src_vt), vt)
            } else if src_vt.is_signed() {
                (to_i64(x, src_vt) as u64) & mask_of(vt)
            } else {
                x & mask_of(vt)
            }
        }
        Op::Bitcast => x & mask_of(vt),
        _ => x,
    }
}

fn eval_binary(op: Op, vt: VarType, x: u64, y: u64) -> u64 {
    if op.is_comparison() {
        let r = if vt.is_float() {
            let (a, b) = (to_f64(x, vt), to_f64(y, vt));
            match op {
                Op::Eq => a == b,
                Op::Neq => a != b,
                Op::Lt => a < b,
                Op::Le => a <= b,
                Op::Gt => a > b,
                Op::Ge => a >= b,
                _ => false,
            }
        } else if vt.is_signed() {
            let (a, b) = (to_i64(x, vt), to_i64(y, vt));
            match op {
                Op::Eq => a == b,
                Op::Neq => a != b,
                Op::Lt => a < b,
                Op::Le => a <= b,
                Op::Gt => a > b,
                Op::Ge => a >= b,
                _ => false,
            }
        } else {
            let (a, b) = (x & mask_of(vt), y & mask_of(vt));
            match op {
                Op::Eq => a == b,
                Op::Neq => a != b,
                Op::Lt => a < b,
                Op::Le => a <= b,
                Op::Gt => a > b,
                Op::Ge => a >= b,
                _ => false,
            }
        };
        return u64::from(r);
    }

    if vt.is_float() {
        let (a, b) = (to_f64(x, vt), to_f64(y, vt));
        let r = match op {
            Op::Add => a + b,
            Op::Sub => a - b,
            Op::Mul => a * b,
            Op::Div => a / b,
            Op::Mod => a % b,
            Op::Min => a.min(b),
            Op::Max => a.max(b),
            _ => a,
        };
        return from_f64(r, vt);
    }

    if vt.is_signed() {
        let (a, b) = (to_i64(x, vt), to_i64(y, vt));
        let r = match op {
            Op::Add => a.wrapping_add(b),
            Op::Sub => a.wrapping_sub(b),
            Op::Mul => a.wrapping_mul(b),
            Op::Div => a.checked_div(b).unwrap_or(0),
            Op::Mod => a.checked_rem(b).unwrap_or(0),
            Op::Mulhi => ((i128::from(a) * i128::from(b)) >> (vt.byte_size() * 8)) as i64,
            Op::Min => a.min(b),
            Op::Max => a.max(b),
            Op::And => a & b,
            Op::Or => a | b,
            Op::Xor => a ^ b,
            Op::Shl => a.wrapping_shl(b as u32),
            Op::Shr => a.wrapping_shr(b as u32),
            _ => a,
        };
        return (r as u64) & mask_of(vt);
    }

    let (a, b) = (x & mask_of(vt), y & mask_of(vt));
    let r = match op {
        Op::Add => a.wrapping_add(b),
        Op::Sub => a.wrapping_sub(b),
        Op::Mul => a.wrapping_mul(b),
        Op::Div => a.checked_div(b).unwrap_or(0),
        Op::Mod => a.checked_rem(b).unwrap_or(0),
        Op::Mulhi => ((u128::from(a) * u128::from(b)) >> (vt.byte_size() * 8)) as u64,
        Op::Min => a.min(b),
        Op::Max => a.max(b),
        Op::And => a & b,
        Op::Or => a | b,
        Op::Xor => a ^ b,
        Op::Shl => a.wrapping_shl(b as u32),
        Op::Shr => a.wrapping_shr(b as u32),
        _ => a,
    };
    r & mask_of(vt)
}

fn eval_ternary(op: Op, vt: VarType, x: u64, y: u64, z: u64) -> u64 {
    match op {
        Op::Fma => {
            if vt.is_float() {
                from_f64(to_f64(x, vt).mul_add(to_f64(y, vt), to_f64(z, vt)), vt)
            } else {
                eval_binary(Op::Add, vt, eval_binary(Op::Mul, vt, x, y), z)
            }
        }
        Op::Select => {
            if x != 0 {
                y
            } else {
                z
            }
        }
        _ => x,
    }
}

unsafe fn load_element(ptr: u64, index: u64, vt: VarType) -> u64 {
    let src = (ptr as *const u8).add(index as usize * vt.byte_size());
    let mut bits = [0u8; 8];
    std::ptr::copy_nonoverlapping(src, bits.as_mut_ptr(), vt.byte_size());
    u64::from_le_bytes(bits)
}

unsafe fn store_element(ptr: u64, index: u64, vt: VarType, bits: u64) {
    let dst = (ptr as *mut u8).add(index as usize * vt.byte_size());
    std::ptr::copy_nonoverlapping(bits.to_le_bytes().as_ptr(), dst, vt.byte_size());
}

/// Execute the kernel's ops for every lane of [start, end).
pub(crate) fn interpret(ops: &[KernelOp], params: &[LaunchParam], start: u32, end: u32) {
    let mut regs = vec![0u64; ops.len()];
    let mut reg_vts = vec![VarType::U32; ops.len()];

    for lane in start..end {
        for (i, op) in ops.iter().enumerate() {
            let (bits, vt) = match *op {
                KernelOp::Const { vt, bits } => (bits, vt),
                KernelOp::Index => (u64::from(lane), VarType::U32),
                KernelOp::Load { param, vt, broadcast } => {
                    let p = params[param as usize];
                    let index = if broadcast { 0 } else { u64::from(lane) };
                    (unsafe { load_element(p.ptr, index, vt) }, vt)
                }
                KernelOp::Unary { op, vt, x } => {
                    (eval_unary(op, vt, reg_vts[x as usize], regs[x as usize]), vt)
                }
                KernelOp::Binary { op, vt, x, y } => {
                    (eval_binary(op, vt, regs[x as usize], regs[y as usize]), vt)
                }
                KernelOp::Ternary { op, vt, x, y, z } => (
                    eval_ternary(op, vt, regs[x as usize], regs[y as usize], regs[z as usize]),
                    vt,
                ),
                KernelOp::Gather { param, vt, index, mask } => {
                    if mask != UNMASKED && regs[mask as usize] == 0 {
                        (0, vt)
                    } else {
                        let p = params[param as usize];
                        let idx = regs[index as usize].min(u64::from(p.size.saturating_sub(1)));
                        (unsafe { load_element(p.ptr, idx, vt) }, vt)
                    }
                }
                KernelOp::Scatter { param, vt, index, value, mask } => {
                    if mask == UNMASKED || regs[mask as usize] != 0 {
                        let p = params[param as usize];
                        let idx = regs[index as usize];
                        if idx < u64::from(p.size) {
                            unsafe { store_element(p.ptr, idx, vt, regs[value as usize]) };
                        }
                    }
                    (0, vt)
                }
                KernelOp::Store { param, vt, x } => {
                    let p = params[param as usize];
                    unsafe { store_element(p.ptr, u64::from(lane), vt, regs[x as usize]) };
                    (0, vt)
                }
            };
            regs[i] = bits;
            reg_vts[i] = vt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unary_and_binary_semantics() {
        let two = 2.0f32.to_bits() as u64;
        let three = 3.0f32.to_bits() as u64;
        let r = eval_binary(Op::Add, VarType::F32, two, three);
        assert_eq!(f32::from_bits(r as u32), 5.0);

        let r = eval_binary(Op::Min, VarType::I32, (-4i32) as u32 as u64, 3);
        assert_eq!(r as u32 as i32, -4);

        let r = eval_unary(Op::Neg, VarType::I32, VarType::I32, 7);
        assert_eq!(r as u32 as i32, -7);

        let r = eval_unary(Op::Cast, VarType::F32, VarType::I32, (-2i32) as u32 as u64);
        assert_eq!(f32::from_bits(r as u32), -2.0);
    }

    #[test]
    fn select_and_fma() {
        assert_eq!(eval_ternary(Op::Select, VarType::U32, 1, 10, 20), 10);
        assert_eq!(eval_ternary(Op::Select, VarType::U32, 0, 10, 20), 20);
        let r = eval_ternary(
            Op::Fma,
            VarType::F32,
            2.0f32.to_bits() as u64,
            3.0f32.to_bits() as u64,
            1.0f32.to_bits() as u64,
        );
        assert_eq!(f32::from_bits(r as u32), 7.0);
    }
}
