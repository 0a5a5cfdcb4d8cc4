//! Just-in-time compiler for fused array computation.
//!
//! Operations on large vector-valued arrays are recorded into a graph of
//! reference-counted variables instead of being executed right away. When
//! a result is demanded, the scheduler fuses the pending computation into
//! as few kernels as possible and hands them to one of two code
//! generating backends: a GPU backend emitting PTX through the CUDA
//! driver API, and a CPU backend emitting IR through an LLVM shared
//! library. Both libraries are discovered and loaded at runtime; a
//! missing library simply disables that backend.
//!
//! Compiled kernels are cached in memory by a content fingerprint of
//! their source and persisted to a dictionary-compressed store under
//! `$HOME/.enoki`, so a restarted process skips recompilation entirely.
//!
//! The crate is thread-safe: any number of threads may record and
//! evaluate work concurrently, each against its own stream or task
//! queue. Cross-thread ordering is established only through the explicit
//! [`sync_thread`]/[`sync_device`]/[`sync_all`] calls.

mod backend;
mod dtype;
mod error;
mod eval;
mod hash;
mod kernel;
mod kernel_cache;
mod log;
mod op;
mod state;
mod thread_state;
mod var;

pub use backend::JitBackend;
pub use dtype::{AsLiteral, VarType};
pub use error::JitError;
pub use kernel::Fingerprint;
pub use log::{set_log_callback, set_log_level_stderr, LogCallback, LogLevel};
pub use op::Op;
pub use var::VarId;

use state::Lock;

// ---------------------------------------------------------------------------
// Lifecycle

/// Initialize the JIT with the requested production backends. Idempotent.
/// A backend whose library or devices cannot be found is disabled rather
/// than reported as an error; creating work for it later raises
/// [`JitError::BackendUnavailable`].
pub fn init(llvm: bool, cuda: bool) -> Result<(), JitError> {
    let mut lock = Lock::acquire();
    state::init(&mut lock, llvm, cuda, false)
}

/// Initialize with the host test device only. Used by the test suite and
/// for running on machines with neither CUDA nor LLVM installed.
pub fn init_dummy() -> Result<(), JitError> {
    let mut lock = Lock::acquire();
    state::init(&mut lock, false, false, true)
}

/// Release every resource held by the JIT and report reference leaks.
/// Returns [`JitError::LeakDetected`] when live variables remain.
pub fn shutdown() -> Result<(), JitError> {
    let mut lock = Lock::acquire();
    state::shutdown(&mut lock)
}

pub fn has_backend(backend: JitBackend) -> bool {
    let lock = Lock::acquire();
    lock.backends.has(backend)
}

/// Number of usable GPU devices.
pub fn cuda_device_count() -> usize {
    let lock = Lock::acquire();
    lock.backends.cuda.as_ref().map(|c| c.device_count()).unwrap_or(0)
}

/// Switch the calling thread to another GPU device.
pub fn cuda_set_device(device: usize) -> Result<(), JitError> {
    let mut lock = Lock::acquire();
    state::cuda_set_device(&mut lock, device)
}

/// Static description of one GPU device.
#[derive(Debug, Clone)]
pub struct CudaDeviceInfo {
    pub name: String,
    /// major * 10 + minor
    pub compute_capability: u32,
    pub num_sm: u32,
    pub shared_memory_bytes: u32,
    pub mem_total: usize,
}

pub fn cuda_device_info(device: usize) -> Option<CudaDeviceInfo> {
    let lock = Lock::acquire();
    let cuda = lock.backends.cuda.as_ref()?;
    cuda.devices.get(device).map(|d| CudaDeviceInfo {
        name: d.name.clone(),
        compute_capability: d.compute_capability,
        num_sm: d.num_sm,
        shared_memory_bytes: d.shared_memory_bytes,
        mem_total: d.mem_total,
    })
}

/// Whether peer access from device `a` to device `b` was established.
pub fn cuda_peer_accessible(a: usize, b: usize) -> bool {
    let lock = Lock::acquire();
    lock.backends.cuda.as_ref().map(|c| c.peer_accessible(a, b)).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Variable construction

/// Create a literal (compile-time constant) of the given size.
pub fn var_literal<T: AsLiteral>(backend: JitBackend, value: T, size: u32) -> VarId {
    let mut lock = Lock::acquire();
    lock.vars.new_literal(backend, T::var_type(), value.to_bits(), size)
}

/// Copy host values into a fresh evaluated buffer variable.
pub fn var_data<T: AsLiteral>(backend: JitBackend, values: &[T]) -> Result<VarId, JitError> {
    let mut lock = Lock::acquire();
    if values.is_empty() {
        return Err(JitError::UnsupportedType("empty arrays are not representable".into()));
    }
    let vt = T::var_type();
    let isize = vt.byte_size();
    let mut bytes = Vec::with_capacity(values.len() * isize);
    for value in values {
        bytes.extend_from_slice(&value.to_bits().to_le_bytes()[..isize]);
    }
    let ts_arc = state::thread_state(&mut lock, backend)?;
    let device = ts_arc.lock().unwrap().device;
    let data = lock.backends.alloc(backend, bytes.len(), device)?;
    lock.backends.copy_from_host(&data, 0, &bytes)?;
    Ok(lock.vars.new_data(backend, vt, values.len() as u32, data))
}

/// Create an op node. Pure ops are deduplicated structurally; calling
/// this twice with identical arguments returns the same id.
pub fn var_op(op: Op, vt: VarType, deps: &[VarId]) -> Result<VarId, JitError> {
    let mut lock = Lock::acquire();
    eval::var_op(&mut lock, op, vt, deps)
}

/// Lane counter `[0, 1, .., size-1]`.
pub fn var_counter(backend: JitBackend, size: u32) -> VarId {
    let mut lock = Lock::acquire();
    eval::var_counter(&mut lock, backend, size)
}

/// Indexed read `source[index]`; pass `0` as `mask` for an unmasked read.
pub fn var_gather(source: VarId, index: VarId, mask: VarId) -> Result<VarId, JitError> {
    let mut lock = Lock::acquire();
    eval::var_gather(&mut lock, source, index, mask)
}

/// Indexed write `target[index] = value`; pass `0` as `mask` for an
/// unmasked write. Returns a handle to the side effect; drop it with
/// [`var_dec_ref`] once recorded.
pub fn var_scatter(
    target: VarId,
    index: VarId,
    value: VarId,
    mask: VarId,
) -> Result<VarId, JitError> {
    let mut lock = Lock::acquire();
    eval::var_scatter(&mut lock, target, index, value, mask)
}

// ---------------------------------------------------------------------------
// Reference counting

/// Take an additional external reference.
pub fn var_inc_ref(id: VarId) {
    let mut lock = Lock::acquire();
    lock.vars.inc_ref_ext(id);
}

/// Drop one external reference; the variable (and everything its death
/// unreferences) is collected eagerly when none remain.
pub fn var_dec_ref(id: VarId) {
    let mut lock = Lock::acquire();
    let mut collected = var::Collected::default();
    lock.vars.dec_ref_ext(id, &mut collected);
    state::process_collected(&mut lock, collected);
}

// ---------------------------------------------------------------------------
// Evaluation and host access

/// Mark a variable for the next evaluation. Returns whether anything is
/// pending for it.
pub fn var_schedule(id: VarId) -> Result<bool, JitError> {
    let mut lock = Lock::acquire();
    eval::var_schedule(&mut lock, id)
}

/// Evaluate `id` right away if it is unevaluated or dirty.
pub fn var_eval(id: VarId) -> Result<(), JitError> {
    let mut lock = Lock::acquire();
    eval::var_eval(&mut lock, id)
}

/// Evaluate everything the calling thread scheduled, on every backend.
pub fn eval() -> Result<(), JitError> {
    let mut lock = Lock::acquire();
    for backend in [JitBackend::Cuda, JitBackend::Llvm, JitBackend::Dummy] {
        if lock.backends.has(backend) {
            eval::eval_backend(&mut lock, backend)?;
        }
    }
    Ok(())
}

/// Read one element, evaluating and synchronizing first.
pub fn var_read<T: AsLiteral>(id: VarId, offset: usize) -> Result<T, JitError> {
    let mut lock = Lock::acquire();
    let isize = T::var_type().byte_size();
    let mut bytes = [0u8; 8];
    eval::var_read(&mut lock, id, offset, &mut bytes[..isize])?;
    Ok(T::from_bits(u64::from_le_bytes(bytes)))
}

/// Write one element. When the storage is shared the write lands in a
/// private copy; the returned id is the caller's new handle either way.
pub fn var_write<T: AsLiteral>(id: VarId, offset: usize, value: T) -> Result<VarId, JitError> {
    let mut lock = Lock::acquire();
    let isize = T::var_type().byte_size();
    let bytes = value.to_bits().to_le_bytes();
    eval::var_write(&mut lock, id, offset, &bytes[..isize])
}

/// Duplicate a variable (new handle, private storage).
pub fn var_copy(id: VarId) -> Result<VarId, JitError> {
    let mut lock = Lock::acquire();
    eval::var_copy(&mut lock, id)
}

/// Stretch a scalar or literal to `size` elements.
pub fn var_resize(id: VarId, size: u32) -> Result<VarId, JitError> {
    let mut lock = Lock::acquire();
    eval::var_resize(&mut lock, id, size)
}

/// Human-readable summary of a variable's contents. Forces evaluation.
pub fn var_str(id: VarId) -> Result<String, JitError> {
    let mut lock = Lock::acquire();
    eval::var_str(&mut lock, id)
}

// ---------------------------------------------------------------------------
// Synchronization

/// Wait for the calling thread's outstanding work on every backend.
pub fn sync_thread() {
    let mut lock = Lock::acquire();
    state::sync_thread(&mut lock);
}

/// Wait for all work on the current GPU device and on every CPU-style
/// thread state.
pub fn sync_device() {
    let mut lock = Lock::acquire();
    state::sync_device(&mut lock);
}

/// Wait for every registered thread state.
pub fn sync_all() {
    let mut lock = Lock::acquire();
    state::sync_all(&mut lock);
}

// ---------------------------------------------------------------------------
// Introspection, labels, tunables

/// Scalar type of a variable.
pub fn var_type(id: VarId) -> Result<VarType, JitError> {
    let lock = Lock::acquire();
    lock.vars.get(id).map(|v| v.vt)
}

/// Logical element count of a variable.
pub fn var_size(id: VarId) -> Result<u32, JitError> {
    let lock = Lock::acquire();
    lock.vars.get(id).map(|v| v.size)
}

/// (internal, external) reference counts; test and debugging aid.
pub fn var_ref_counts(id: VarId) -> Option<(u32, u32)> {
    let lock = Lock::acquire();
    lock.vars.get(id).ok().map(|v| (v.ref_count_int, v.ref_count_ext))
}

/// Whether the variable has been materialized into a buffer.
pub fn var_is_evaluated(id: VarId) -> bool {
    let lock = Lock::acquire();
    lock.vars.get(id).map(|v| v.is_data()).unwrap_or(false)
}

/// Number of live variables.
pub fn n_variables() -> usize {
    let lock = Lock::acquire();
    lock.vars.len()
}

/// Number of entries in the structural deduplication cache.
pub fn cse_cache_size() -> usize {
    let lock = Lock::acquire();
    lock.vars.cse_len()
}

/// Attach a descriptive label shown in log output and leak reports.
pub fn var_set_label(id: VarId, label: &str) -> Result<(), JitError> {
    let mut lock = Lock::acquire();
    lock.vars.get(id)?;
    lock.vars.extra(id).label = Some(label.into());
    Ok(())
}

pub fn var_label(id: VarId) -> Option<String> {
    let lock = Lock::acquire();
    lock.vars.label(id).map(str::to_owned)
}

/// Install a callback invoked once when the variable is collected.
pub fn var_set_callback(
    id: VarId,
    callback: impl Fn(VarId) + Send + 'static,
) -> Result<(), JitError> {
    let mut lock = Lock::acquire();
    lock.vars.get(id)?;
    let extra = lock.vars.extra(id);
    extra.free_callback = Some(Box::new(callback));
    extra.callback_internal = false;
    Ok(())
}

/// Kernel cache counters since init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStats {
    /// In-memory fingerprint matches
    pub hits: u64,
    /// Misses resolved from the on-disk store without compiling
    pub soft_misses: u64,
    /// Misses that required a full compile
    pub hard_misses: u64,
    /// Total kernel launches
    pub launches: u64,
}

pub fn kernel_stats() -> KernelStats {
    let lock = Lock::acquire();
    KernelStats {
        hits: lock.kernel_cache.hits,
        soft_misses: lock.kernel_cache.soft_misses,
        hard_misses: lock.kernel_cache.hard_misses,
        launches: lock.kernel_cache.launches,
    }
}

/// Elements per CPU work item (default 16384).
pub fn set_cpu_block_size(size: u32) {
    let mut lock = Lock::acquire();
    lock.cpu_block_size = size.max(1);
}

pub fn cpu_block_size() -> u32 {
    let lock = Lock::acquire();
    lock.cpu_block_size
}
