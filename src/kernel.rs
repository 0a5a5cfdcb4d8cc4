//! Scheduled kernels and compiled kernel artifacts.

use nanoserde::{DeBin, SerBin};

use crate::backend::JitBackend;
use crate::dtype::VarType;
use crate::op::Op;
use crate::var::VarId;

/// Register slot inside a scheduled kernel; slot index == op index.
pub type Slot = u32;

/// One operation of a scheduled kernel in emission order. Slots reference
/// earlier ops, params reference the kernel's buffer argument table.
#[derive(Debug, Clone, Copy, PartialEq, SerBin, DeBin)]
pub enum KernelOp {
    /// Inline constant
    Const { vt: VarType, bits: u64 },
    /// Lane index 0..size as u32
    Index,
    /// Elementwise read of argument `param`; size-1 buffers broadcast
    Load { param: u32, vt: VarType, broadcast: bool },
    Unary { op: Op, vt: VarType, x: Slot },
    Binary { op: Op, vt: VarType, x: Slot, y: Slot },
    Ternary { op: Op, vt: VarType, x: Slot, y: Slot, z: Slot },
    /// Indexed read from argument `param`; `mask == !0` means unmasked
    Gather { param: u32, vt: VarType, index: Slot, mask: Slot },
    /// Indexed write to argument `param`
    Scatter { param: u32, vt: VarType, index: Slot, value: Slot, mask: Slot },
    /// Elementwise write of slot `x` to argument `param`
    Store { param: u32, vt: VarType, x: Slot },
}

pub const UNMASKED: Slot = !0;

/// Direction of one kernel buffer argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Input,
    Output,
    /// Scatter target: read and written in place
    InOut,
}

/// Ordered list of ops plus its buffer argument table, produced by the
/// scheduler. Identical scheduled kernels must render to byte-identical
/// source, so everything here is built in a deterministic order.
#[derive(Debug)]
pub struct ScheduledKernel {
    pub backend: JitBackend,
    /// Launch width in elements
    pub size: u32,
    pub ops: Vec<KernelOp>,
    /// Buffer arguments in the order they are passed at launch
    pub params: Vec<(VarId, ParamKind)>,
}

impl ScheduledKernel {
    /// Canonical text form; the code generators embed it or replace it,
    /// and the fingerprint is computed over whatever they emit.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut s = String::with_capacity(64 + self.ops.len() * 24);
        let _ = writeln!(s, "// kernel backend={} size={}", self.backend.name(), self.size);
        for (i, op) in self.ops.iter().enumerate() {
            let _ = writeln!(s, "%{i} = {op:?}");
        }
        s
    }
}

/// 128-bit content hash of the generated kernel source combined with the
/// device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u128);

impl Fingerprint {
    pub fn compute(source: &str, device_key: &str) -> Fingerprint {
        let mut bytes = Vec::with_capacity(source.len() + device_key.len() + 1);
        bytes.extend_from_slice(source.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(device_key.as_bytes());
        Fingerprint(xxhash_rust::xxh3::xxh3_128(&bytes))
    }

    /// Lowercase hex, 32 digits; used as the on-disk file name.
    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }

    pub fn from_hex(s: &str) -> Option<Fingerprint> {
        if s.len() != 32 {
            return None;
        }
        u128::from_str_radix(s, 16).ok().map(Fingerprint)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Backend-resident form of a compiled kernel.
pub enum Program {
    /// Loaded CUDA module + entry function
    Cuda { module: *mut std::ffi::c_void, function: *mut std::ffi::c_void },
    /// Executable host memory; `entry` offsets into the mapping
    Cpu { code: crate::backend::llvm::ExecMem, entry: usize, reloc: Vec<usize> },
    /// Interpreted program of the host test device
    Interp { ops: std::sync::Arc<Vec<KernelOp>> },
}

// Programs are shared-immutable once published; module and function
// handles are only passed back to their owning driver.
unsafe impl Send for Program {}
unsafe impl Sync for Program {}

/// Cached kernel entry.
pub struct Kernel {
    pub backend: JitBackend,
    pub fingerprint: Fingerprint,
    /// Generated source, kept for persistence and diagnostics
    pub source: String,
    pub entry: String,
    pub program: Program,
    /// Compiled artifact size in bytes (0 when the module owns the storage)
    pub size: usize,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("backend", &self.backend)
            .field("fingerprint", &self.fingerprint.to_hex())
            .field("entry", &self.entry)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let fp = Fingerprint(0x0123_4567_89ab_cdef_0011_2233_4455_6677);
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(Fingerprint::from_hex(&hex), Some(fp));
        assert_eq!(Fingerprint::from_hex("xyz"), None);
    }

    /// The device identity is part of the kernel's identity: the same
    /// source compiled for two compute capabilities (or two CPU feature
    /// sets) must never collide in the cache.
    #[test]
    fn device_key_separates_kernels() {
        let src = ".visible .entry enoki_kernel() { ret; }";
        let a = Fingerprint::compute(src, "sm_70");
        let b = Fingerprint::compute(src, "sm_86");
        let c = Fingerprint::compute(src, "sm_70");
        assert_ne!(a, b);
        assert_eq!(a, c);

        let d = Fingerprint::compute(src, "x86_64;skylake;+avx2;w8");
        let e = Fingerprint::compute(src, "x86_64;skylake;+avx512vl;w16");
        assert_ne!(d, e);
    }

    #[test]
    fn kernel_ops_round_trip_through_nanoserde() {
        use nanoserde::{DeBin, SerBin};
        let ops = vec![
            KernelOp::Index,
            KernelOp::Const { vt: crate::dtype::VarType::F32, bits: 0x3f80_0000 },
            KernelOp::Binary { op: crate::op::Op::Add, vt: crate::dtype::VarType::F32, x: 0, y: 1 },
            KernelOp::Store { param: 0, vt: crate::dtype::VarType::F32, x: 2 },
        ];
        let bytes = SerBin::serialize_bin(&ops);
        let back: Vec<KernelOp> = DeBin::deserialize_bin(&bytes).unwrap();
        assert_eq!(back, ops);
    }
}
