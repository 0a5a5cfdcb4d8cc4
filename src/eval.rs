//! Scheduler and evaluator: turn demanded variables into fused kernels.
//!
//! The root set is the calling thread's scheduled variables plus its
//! pending side effects. A reverse dependency walk collects the
//! unevaluated subgraph; ids are append-only and every dependency has a
//! smaller id, so ascending id order is a deterministic topological
//! order. The order is partitioned into kernels by launch size, and each
//! scatter closes its kernel so later reads observe the write.

use std::sync::{Arc, Mutex};

use crate::backend::{cuda::CudaBackend, dummy::DummyBackend, llvm::LlvmBackend};
use crate::backend::{Data, JitBackend, LaunchParam};
use crate::hash::{Map, Set};
use crate::dtype::VarType;
use crate::error::{jit_fail, JitError};
use crate::kernel::{Fingerprint, Kernel, KernelOp, ParamKind, Program, ScheduledKernel, Slot, UNMASKED};
use crate::kernel_cache::Probe;
use crate::log::jit_log;
use crate::op::Op;
use crate::state::{process_collected, thread_state, Lock};
use crate::thread_state::ThreadState;
use crate::var::{Collected, VarId, VarKind};

/// Entry point name used by every generated kernel; modules are compiled
/// per kernel so the name never collides.
const ENTRY: &str = "enoki_kernel";

// ---------------------------------------------------------------------------
// Variable creation with side-effect flushing

/// Create an op node, evaluating pending scatters first when an operand
/// is dirty (reads must observe earlier writes in program order).
pub(crate) fn var_op(
    lock: &mut Lock,
    op: Op,
    vt: VarType,
    deps: &[VarId],
) -> Result<VarId, JitError> {
    if matches!(op, Op::Gather | Op::Scatter | Op::Counter) {
        return Err(JitError::UnsupportedType(
            "memory and counter ops have dedicated constructors".into(),
        ));
    }
    if deps.len() != op.arity() {
        return Err(JitError::UnsupportedType(
            format!("{op} takes {} inputs, got {}", op.arity(), deps.len()).into(),
        ));
    }
    if op.is_comparison() && vt != VarType::Bool {
        return Err(JitError::UnsupportedType("comparisons produce a mask".into()));
    }

    let backend = lock.vars.get(deps[0])?.backend;
    flush_dirty(lock, backend, deps)?;

    let mut padded = [0 as VarId; 4];
    padded[..deps.len()].copy_from_slice(deps);
    lock.vars.new_op(backend, op, vt, padded)
}

pub(crate) fn var_counter(lock: &mut Lock, backend: JitBackend, size: u32) -> VarId {
    lock.vars.new_counter(backend, size)
}

/// Indexed read. The source must hold data; unevaluated or dirty sources
/// are evaluated first.
pub(crate) fn var_gather(
    lock: &mut Lock,
    source: VarId,
    index: VarId,
    mask: VarId,
) -> Result<VarId, JitError> {
    let backend = lock.vars.get(source)?.backend;
    ensure_evaluated(lock, source)?;
    flush_dirty(lock, backend, &[source, index, mask])?;
    lock.vars.new_gather(source, index, mask)
}

/// Indexed write. Marks the target dirty and registers the scatter with
/// the calling thread's side-effect list (which owns one reference until
/// the write is materialized). The returned handle belongs to the caller.
pub(crate) fn var_scatter(
    lock: &mut Lock,
    target: VarId,
    index: VarId,
    value: VarId,
    mask: VarId,
) -> Result<VarId, JitError> {
    let backend = lock.vars.get(target)?.backend;
    ensure_evaluated(lock, target)?;
    let id = lock.vars.new_scatter(target, index, value, mask)?;
    lock.vars.inc_ref_ext(id);
    let ts_arc = thread_state(lock, backend)?;
    ts_arc.lock().unwrap().side_effects.push(id);
    Ok(id)
}

/// Mark a variable for the next evaluation without forcing one.
pub(crate) fn var_schedule(lock: &mut Lock, id: VarId) -> Result<bool, JitError> {
    let v = lock.vars.get(id)?;
    if v.is_node() {
        let backend = v.backend;
        let ts_arc = thread_state(lock, backend)?;
        ts_arc.lock().unwrap().scheduled.push(id);
        jit_log!(Debug, "eval", "schedule(r{id})");
        Ok(true)
    } else {
        Ok(v.is_dirty())
    }
}

/// Evaluate `id` right away if it is unevaluated or dirty.
pub(crate) fn var_eval(lock: &mut Lock, id: VarId) -> Result<(), JitError> {
    let v = lock.vars.get(id)?;
    let backend = v.backend;
    if v.is_node() || v.is_dirty() {
        if lock.vars.get(id)?.is_node() {
            let ts_arc = thread_state(lock, backend)?;
            ts_arc.lock().unwrap().scheduled.push(id);
        }
        eval_backend(lock, backend)?;
        let v = lock.vars.get(id)?;
        if v.is_dirty() {
            jit_fail!("var_eval(): r{id} remains dirty after evaluation");
        }
        if !v.is_data() && !v.is_literal() {
            jit_fail!("var_eval(): r{id} was not materialized by evaluation");
        }
    }
    Ok(())
}

fn ensure_evaluated(lock: &mut Lock, id: VarId) -> Result<(), JitError> {
    let v = lock.vars.get(id)?;
    if v.is_literal() {
        // Splice the constant into a real buffer
        let (backend, vt, size, bits) = (v.backend, v.vt, v.size, v.literal);
        let ts_arc = thread_state(lock, backend)?;
        let device = ts_arc.lock().unwrap().device;
        let data = lock.backends.alloc(backend, size as usize * vt.byte_size(), device)?;
        let element: Vec<u8> = bits.to_le_bytes()[..vt.byte_size()].to_vec();
        let mut bytes = Vec::with_capacity(size as usize * vt.byte_size());
        for _ in 0..size {
            bytes.extend_from_slice(&element);
        }
        lock.backends.copy_from_host(&data, 0, &bytes)?;
        let mut collected = Collected::default();
        lock.vars.set_evaluated(id, data, &mut collected);
        process_collected(lock, collected);
        return Ok(());
    }
    if !v.is_data() {
        var_eval(lock, id)?;
    }
    Ok(())
}

fn flush_dirty(lock: &mut Lock, backend: JitBackend, deps: &[VarId]) -> Result<(), JitError> {
    let mut dirty = false;
    for &dep in deps {
        if dep != 0 && lock.vars.get(dep)?.is_dirty() {
            dirty = true;
        }
    }
    if dirty {
        eval_backend(lock, backend)?;
        for &dep in deps {
            if dep != 0 && lock.vars.get(dep)?.is_dirty() {
                jit_fail!("r{dep} remains dirty after evaluation");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Evaluation

/// Evaluate the calling thread's pending work on `backend`.
pub(crate) fn eval_backend(lock: &mut Lock, backend: JitBackend) -> Result<(), JitError> {
    if lock.shutdown_in_progress {
        return Err(JitError::ShutdownInProgress);
    }
    // Nothing to do unless this thread already recorded work
    let Some(ts_arc) = crate::state::existing_thread_state(lock, backend) else {
        return Ok(());
    };
    let (scheduled, side_effects) = {
        let mut ts = ts_arc.lock().unwrap();
        (std::mem::take(&mut ts.scheduled), std::mem::take(&mut ts.side_effects))
    };
    if scheduled.is_empty() && side_effects.is_empty() {
        return Ok(());
    }

    // Root set: demanded variables plus pending side effects. Scheduled
    // entries hold no reference, so drop the ones that already died.
    let mut roots: Vec<VarId> = Vec::with_capacity(scheduled.len() + side_effects.len());
    for id in scheduled.into_iter().chain(side_effects.iter().copied()) {
        if lock.vars.contains(id) {
            roots.push(id);
        }
    }

    // Reverse walk over the unevaluated subgraph, explicit stack
    let mut visited: Set<VarId> = Set::default();
    let mut stack = roots.clone();
    while let Some(id) = stack.pop() {
        let v = lock.vars.var(id);
        if v.is_data() {
            continue;
        }
        if !visited.insert(id) {
            continue;
        }
        if v.is_literal() {
            continue; // literal root: materialized below, deps are empty
        }
        let deps = v.deps;
        for dep in deps {
            if dep == 0 {
                continue;
            }
            if lock.vars.var(dep).is_node() {
                stack.push(dep);
            }
        }
    }
    if visited.is_empty() {
        return Ok(());
    }

    // Ascending ids are a topological order (I1)
    let mut order: Vec<VarId> = visited.into_iter().collect();
    order.sort_unstable();

    // Partition into kernels: one launch size per kernel, scatters close
    // their kernel so later reads observe the write
    let mut groups: Vec<Vec<VarId>> = Vec::new();
    let mut current: Vec<VarId> = Vec::new();
    let mut current_size = 0u32;
    for id in order {
        let v = lock.vars.var(id);
        if !current.is_empty() && v.size != current_size {
            groups.push(std::mem::take(&mut current));
        }
        current_size = v.size;
        let scatter = v.scatter;
        current.push(id);
        if scatter {
            groups.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }

    let roots_set: Set<VarId> = roots.iter().copied().collect();
    jit_log!(
        Debug,
        "eval",
        "evaluating {} roots on {} in {} kernel{}",
        roots.len(),
        backend.name(),
        groups.len(),
        if groups.len() == 1 { "" } else { "s" }
    );

    let mut result = Ok(());
    for nodes in groups {
        result = execute_kernel(lock, &ts_arc, backend, &nodes, &roots_set);
        if result.is_err() {
            break;
        }
    }

    // The side-effect list's references drop once the writes are issued
    // (or abandoned after a failure)
    let mut collected = Collected::default();
    for id in side_effects {
        if lock.vars.contains(id) {
            lock.vars.dec_ref_ext(id, &mut collected);
        }
    }
    process_collected(lock, collected);
    result
}

/// Emit, cache, and launch one fused kernel, then flip its outputs into
/// evaluated buffers.
fn execute_kernel(
    lock: &mut Lock,
    ts_arc: &Arc<Mutex<ThreadState>>,
    backend: JitBackend,
    nodes: &[VarId],
    roots_set: &Set<VarId>,
) -> Result<(), JitError> {
    let device = ts_arc.lock().unwrap().device;
    let size = lock.vars.var(nodes[0]).size;
    let node_set: Set<VarId> = nodes.iter().copied().collect();

    // Uses of each node by other nodes of this kernel; anything referenced
    // beyond that must be materialized
    let mut internal_uses: Map<VarId, u32> = Map::default();
    for &id in nodes {
        for dep in lock.vars.var(id).deps {
            if dep != 0 && node_set.contains(&dep) {
                *internal_uses.entry(dep).or_insert(0) += 1;
            }
        }
    }

    let mut outputs: Vec<VarId> = Vec::new();
    let mut scatters: Vec<VarId> = Vec::new();
    for &id in nodes {
        let v = lock.vars.var(id);
        if v.scatter {
            scatters.push(id);
            continue;
        }
        let internal = internal_uses.get(&id).copied().unwrap_or(0);
        if roots_set.contains(&id) || v.ref_count_ext > 0 || internal < v.ref_count_int {
            outputs.push(id);
        }
    }

    // Build the scheduled kernel
    let mut ops: Vec<KernelOp> = Vec::with_capacity(nodes.len() + outputs.len());
    let mut params: Vec<(VarId, ParamKind)> = Vec::new();
    let mut param_of: Map<VarId, u32> = Map::default();
    let mut slot_of: Map<VarId, Slot> = Map::default();
    let mut const_slots: Map<(VarType, u64), Slot> = Map::default();

    fn param_for(
        params: &mut Vec<(VarId, ParamKind)>,
        param_of: &mut Map<VarId, u32>,
        id: VarId,
        kind: ParamKind,
    ) -> u32 {
        if let Some(&index) = param_of.get(&id) {
            if kind == ParamKind::InOut {
                params[index as usize].1 = ParamKind::InOut;
            }
            return index;
        }
        let index = params.len() as u32;
        params.push((id, kind));
        param_of.insert(id, index);
        index
    }

    // Resolve one dependency to a register slot, inserting Const/Load ops
    // on first use
    macro_rules! slot_for {
        ($dep:expr) => {{
            let dep: VarId = $dep;
            if let Some(&slot) = slot_of.get(&dep) {
                slot
            } else {
                let v = lock.vars.var(dep);
                match v.kind {
                    VarKind::Literal => {
                        let key = (v.vt, v.literal);
                        if let Some(&slot) = const_slots.get(&key) {
                            slot
                        } else {
                            let slot = ops.len() as Slot;
                            ops.push(KernelOp::Const { vt: v.vt, bits: v.literal });
                            const_slots.insert(key, slot);
                            slot
                        }
                    }
                    VarKind::Data => {
                        let param =
                            param_for(&mut params, &mut param_of, dep, ParamKind::Input);
                        let slot = ops.len() as Slot;
                        ops.push(KernelOp::Load { param, vt: v.vt, broadcast: v.size == 1 });
                        slot_of.insert(dep, slot);
                        slot
                    }
                    VarKind::Node(_) => {
                        jit_fail!("r{dep}: dependency was not scheduled before its consumer")
                    }
                }
            }
        }};
    }

    for &id in nodes {
        let v = lock.vars.var(id);
        let (vt, deps) = (v.vt, v.deps);
        let slot = match v.kind {
            VarKind::Literal => {
                let bits = v.literal;
                let key = (vt, bits);
                if let Some(&slot) = const_slots.get(&key) {
                    slot
                } else {
                    let slot = ops.len() as Slot;
                    ops.push(KernelOp::Const { vt, bits });
                    const_slots.insert(key, slot);
                    slot
                }
            }
            VarKind::Data => jit_fail!("r{id}: evaluated variable in kernel schedule"),
            VarKind::Node(op) => match op {
                Op::Counter => {
                    let slot = ops.len() as Slot;
                    ops.push(KernelOp::Index);
                    slot
                }
                Op::Gather => {
                    let param = param_for(&mut params, &mut param_of, deps[0], ParamKind::Input);
                    let index = slot_for!(deps[1]);
                    let mask = if deps[2] != 0 { slot_for!(deps[2]) } else { UNMASKED };
                    let slot = ops.len() as Slot;
                    ops.push(KernelOp::Gather { param, vt, index, mask });
                    slot
                }
                Op::Scatter => {
                    let param = param_for(&mut params, &mut param_of, deps[0], ParamKind::InOut);
                    let index = slot_for!(deps[1]);
                    let value = slot_for!(deps[2]);
                    let mask = if deps[3] != 0 { slot_for!(deps[3]) } else { UNMASKED };
                    let slot = ops.len() as Slot;
                    ops.push(KernelOp::Scatter { param, vt, index, value, mask });
                    slot
                }
                op => {
                    let arity = op.arity();
                    let mut arg_slots = [0 as Slot; 4];
                    for (i, slot) in arg_slots.iter_mut().enumerate().take(arity) {
                        *slot = slot_for!(deps[i]);
                    }
                    // Comparisons produce a mask but compute in the
                    // operand type
                    let vt = if op.is_comparison() { lock.vars.var(deps[0]).vt } else { vt };
                    let slot = ops.len() as Slot;
                    match arity {
                        1 => ops.push(KernelOp::Unary { op, vt, x: arg_slots[0] }),
                        2 => ops.push(KernelOp::Binary {
                            op,
                            vt,
                            x: arg_slots[0],
                            y: arg_slots[1],
                        }),
                        3 => ops.push(KernelOp::Ternary {
                            op,
                            vt,
                            x: arg_slots[0],
                            y: arg_slots[1],
                            z: arg_slots[2],
                        }),
                        n => jit_fail!("unexpected arity {n} for {op}"),
                    }
                    slot
                }
            },
        };
        slot_of.insert(id, slot);
    }

    for &id in &outputs {
        let v = lock.vars.var(id);
        let param = param_for(&mut params, &mut param_of, id, ParamKind::Output);
        ops.push(KernelOp::Store { param, vt: v.vt, x: slot_of[&id] });
    }

    let scheduled = ScheduledKernel { backend, size, ops, params };

    // Emit into the thread's scratch buffer and fingerprint the text
    // together with the device identity
    let mut scratch = std::mem::take(&mut ts_arc.lock().unwrap().scratch);
    lock.backends.emit(&scheduled, ENTRY, &mut scratch);
    let device_key = lock.backends.device_key(backend, device);
    let fp = Fingerprint::compute(&scratch, &device_key);
    let source = scratch.clone();
    ts_arc.lock().unwrap().scratch = scratch;

    let kernel = resolve_kernel(lock, &scheduled, source, fp, &device_key, device)?;

    // Allocate output storage and collect launch arguments
    let mut fresh: Vec<(VarId, Data)> = Vec::with_capacity(outputs.len());
    let mut launch_params: Vec<LaunchParam> = Vec::with_capacity(scheduled.params.len());
    for (id, kind) in &scheduled.params {
        let v = lock.vars.var(*id);
        match kind {
            ParamKind::Input | ParamKind::InOut => {
                let data = match &v.data {
                    Some(data) => data.clone(),
                    None => jit_fail!("r{id}: kernel input has no storage"),
                };
                launch_params.push(LaunchParam { ptr: data.raw_ptr(), size: v.size });
            }
            ParamKind::Output => {
                let bytes = v.size as usize * v.vt.byte_size();
                let vsize = v.size;
                let data = lock.backends.alloc(backend, bytes, device)?;
                launch_params.push(LaunchParam { ptr: data.raw_ptr(), size: vsize });
                fresh.push((*id, data));
            }
        }
    }

    {
        let mut ts = ts_arc.lock().unwrap();
        let cpu_block_size = lock.cpu_block_size;
        lock.backends.launch(&kernel, &mut ts, launch_params, size, cpu_block_size)?;
    }
    lock.kernel_cache.launches += 1;

    // Outputs become evaluated buffers (deps cleared, I4); scatters have
    // delivered their write and release their operands
    let mut collected = Collected::default();
    for (id, data) in fresh {
        lock.vars.set_evaluated(id, data, &mut collected);
    }
    for id in scatters {
        let target = lock.vars.var(id).deps[0];
        lock.vars.set_executed(id, &mut collected);
        if lock.vars.contains(target) {
            lock.vars.var_mut(target).dirty = false;
        }
    }
    process_collected(lock, collected);
    Ok(())
}

/// Fetch the kernel for `fp`, sharing one compile among concurrent
/// callers through the cache's pending marker. The compile (or the disk
/// load) runs with the global lock released.
fn resolve_kernel(
    lock: &mut Lock,
    scheduled: &ScheduledKernel,
    source: String,
    fp: Fingerprint,
    device_key: &str,
    device: usize,
) -> Result<Arc<Kernel>, JitError> {
    enum Target {
        Cuda(Arc<CudaBackend>, usize),
        Llvm(Arc<LlvmBackend>),
        Dummy(Arc<DummyBackend>),
    }

    loop {
        match lock.kernel_cache.probe(fp) {
            Probe::Hit(kernel) => return Ok(kernel),
            Probe::InFlight(pending) => {
                lock.unlocked(|| pending.wait());
                continue;
            }
            Probe::Miss { on_disk } => {
                let target = match scheduled.backend {
                    JitBackend::Cuda => match lock.backends.cuda.clone() {
                        Some(b) => Target::Cuda(b, device),
                        None => {
                            lock.kernel_cache.abandon(fp);
                            return Err(JitError::BackendUnavailable("cuda".into()));
                        }
                    },
                    JitBackend::Llvm => match lock.backends.llvm.clone() {
                        Some(b) => Target::Llvm(b),
                        None => {
                            lock.kernel_cache.abandon(fp);
                            return Err(JitError::BackendUnavailable("llvm".into()));
                        }
                    },
                    JitBackend::Dummy => match lock.backends.dummy.clone() {
                        Some(b) => Target::Dummy(b),
                        None => {
                            lock.kernel_cache.abandon(fp);
                            return Err(JitError::BackendUnavailable("dummy".into()));
                        }
                    },
                };
                let entry_path =
                    lock.kernel_cache.cache_dir().map(|dir| dir.join(fp.to_hex()));
                let device_key = device_key.to_string();

                // Heavy work: disk load, validation, compilation
                let compiled = lock.unlocked(|| {
                    if on_disk {
                        if let Some(path) = &entry_path {
                            match crate::kernel_cache::read_entry(path, fp) {
                                Ok((disk_backend, disk_source, artifact))
                                    if disk_backend == scheduled.backend
                                        && Fingerprint::compute(&disk_source, &device_key)
                                            == fp =>
                                {
                                    let loaded = match &target {
                                        Target::Cuda(b, dev) => {
                                            b.compile(&disk_source, ENTRY, *dev)
                                        }
                                        Target::Llvm(b) => b.load_artifact(&artifact),
                                        Target::Dummy(b) => b.load_artifact(&artifact),
                                    };
                                    if let Ok(program) = loaded {
                                        return Ok((program, true));
                                    }
                                    jit_log!(
                                        Warn,
                                        "cache",
                                        "stale artifact for {fp}, recompiling"
                                    );
                                }
                                Ok(_) => {
                                    jit_log!(Warn, "cache", "mismatched entry for {fp}, recompiling");
                                }
                                Err(err) => {
                                    jit_log!(Warn, "cache", "{err}, recompiling");
                                }
                            }
                        }
                    }
                    let program = match &target {
                        Target::Cuda(b, dev) => b.compile(&source, ENTRY, *dev),
                        Target::Llvm(b) => b.compile(&source, ENTRY),
                        Target::Dummy(b) => b.compile(scheduled),
                    }?;
                    Ok::<_, crate::error::BackendError>((program, false))
                });

                let (program, from_disk) = match compiled {
                    Ok(result) => result,
                    Err(err) => {
                        lock.kernel_cache.abandon(fp);
                        return Err(err.into());
                    }
                };

                let artifact = match (&program, scheduled.backend) {
                    (_, JitBackend::Cuda) => Vec::new(),
                    (program, JitBackend::Llvm) => LlvmBackend::artifact_bytes(program),
                    (program, JitBackend::Dummy) => DummyBackend::artifact_bytes(program),
                };
                let size = match &program {
                    Program::Cpu { code, .. } => code.len(),
                    _ => source.len(),
                };
                let kernel = Arc::new(Kernel {
                    backend: scheduled.backend,
                    fingerprint: fp,
                    source,
                    entry: ENTRY.into(),
                    program,
                    size,
                });
                lock.kernel_cache.insert(kernel.clone(), from_disk);
                if !from_disk {
                    lock.kernel_cache.persist(&kernel, artifact);
                }
                return Ok(kernel);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Host access

/// Copy one element (or a span of elements) out of a variable,
/// evaluating and synchronizing first so the bytes are observable.
pub(crate) fn var_read(
    lock: &mut Lock,
    id: VarId,
    offset: usize,
    dst: &mut [u8],
) -> Result<(), JitError> {
    let v = lock.vars.get(id)?;
    if v.is_literal() && !v.is_dirty() {
        let isize = v.vt.byte_size();
        if dst.len() > isize {
            return Err(JitError::UnsupportedType("literal reads are single-element".into()));
        }
        let bytes = v.literal.to_le_bytes();
        dst.copy_from_slice(&bytes[..dst.len()]);
        return Ok(());
    }
    var_eval(lock, id)?;
    crate::state::sync_thread(lock);

    let v = lock.vars.get(id)?;
    let isize = v.vt.byte_size();
    let offset = if v.size == 1 { 0 } else { offset };
    if (offset + dst.len() / isize.max(1)) > v.size as usize {
        return Err(JitError::InvalidHandle(id));
    }
    let data = v.data.clone().expect("evaluated variable without storage");
    lock.backends.copy_to_host(&data, offset * isize, dst).map_err(Into::into)
}

/// Overwrite one element of a variable. When other holders can observe
/// the storage, the write lands in a private copy whose id is returned.
pub(crate) fn var_write(
    lock: &mut Lock,
    id: VarId,
    offset: usize,
    src: &[u8],
) -> Result<VarId, JitError> {
    var_eval(lock, id)?;
    let v = lock.vars.get(id)?;
    let shared = v.ref_count_ext > 1 || v.ref_count_int > 0;
    let id = if shared { var_copy(lock, id)? } else { id };

    crate::state::sync_thread(lock);
    let v = lock.vars.get(id)?;
    let isize = v.vt.byte_size();
    if offset >= v.size as usize || src.len() != isize {
        return Err(JitError::InvalidHandle(id));
    }
    let data = v.data.clone().expect("evaluated variable without storage");
    lock.backends.copy_from_host(&data, offset * isize, src)?;
    if !shared {
        lock.vars.inc_ref_ext(id);
    }
    Ok(id)
}

/// Stretch a scalar (or literal) to `size` elements. Resizing to the
/// current size just takes another reference.
pub(crate) fn var_resize(lock: &mut Lock, id: VarId, size: u32) -> Result<VarId, JitError> {
    let v = lock.vars.get(id)?;
    if v.size == size {
        lock.vars.inc_ref_ext(id);
        return Ok(id);
    }
    if v.is_literal() {
        let (backend, vt, bits) = (v.backend, v.vt, v.literal);
        return Ok(lock.vars.new_literal(backend, vt, bits, size));
    }
    if v.size != 1 {
        return Err(JitError::SizeMismatch(
            format!("r{id} has size {}, only scalars and literals resize", v.size).into(),
        ));
    }
    let backend = v.backend;
    flush_dirty(lock, backend, &[id])?;
    lock.vars.new_broadcast(id, size)
}

/// Print limit of [`var_str`]: arrays beyond this many elements elide
/// their middle.
const PRINT_LIMIT: usize = 20;

/// Human-readable summary of a variable's contents, evaluating first.
pub(crate) fn var_str(lock: &mut Lock, id: VarId) -> Result<String, JitError> {
    use std::fmt::Write;

    let v = lock.vars.get(id)?;
    let (vt, size) = (v.vt, v.size as usize);
    if v.is_literal() && !v.is_dirty() {
        let text = crate::dtype::literal_display(v.literal, vt);
        return Ok(if size == 1 {
            format!("[{text}]")
        } else {
            format!("[{text}, .. {size} times ..]")
        });
    }

    var_eval(lock, id)?;
    crate::state::sync_thread(lock);
    let v = lock.vars.get(id)?;
    let isize = vt.byte_size();
    let data = v.data.clone().expect("evaluated variable without storage");
    let mut bytes = vec![0u8; size * isize];
    lock.backends.copy_to_host(&data, 0, &mut bytes)?;

    let element = |i: usize| {
        let mut bits = [0u8; 8];
        bits[..isize].copy_from_slice(&bytes[i * isize..(i + 1) * isize]);
        crate::dtype::literal_display(u64::from_le_bytes(bits), vt)
    };

    let mut out = String::from("[");
    let mut i = 0;
    while i < size {
        if size > PRINT_LIMIT && i == PRINT_LIMIT / 2 {
            let _ = write!(out, ".. {} skipped .., ", size - PRINT_LIMIT);
            i = size - PRINT_LIMIT / 2;
            continue;
        }
        out.push_str(&element(i));
        if i + 1 < size {
            out.push_str(", ");
        }
        i += 1;
    }
    out.push(']');
    Ok(out)
}

/// Duplicate a variable. Literals copy their payload; everything else is
/// evaluated and cloned buffer-to-buffer through the host.
pub(crate) fn var_copy(lock: &mut Lock, id: VarId) -> Result<VarId, JitError> {
    let v = lock.vars.get(id)?;
    if v.is_literal() {
        let (backend, vt, bits, size) = (v.backend, v.vt, v.literal, v.size);
        return Ok(lock.vars.new_literal(backend, vt, bits, size));
    }
    var_eval(lock, id)?;
    crate::state::sync_thread(lock);

    let v = lock.vars.get(id)?;
    let (backend, vt, size) = (v.backend, v.vt, v.size);
    let bytes = size as usize * vt.byte_size();
    let src = v.data.clone().expect("evaluated variable without storage");
    let ts_arc = thread_state(lock, backend)?;
    let device = ts_arc.lock().unwrap().device;
    let dst = lock.backends.alloc(backend, bytes, device)?;

    let mut staging = vec![0u8; bytes];
    lock.backends.copy_to_host(&src, 0, &mut staging)?;
    lock.backends.copy_from_host(&dst, 0, &staging)?;
    Ok(lock.vars.new_data(backend, vt, size, dst))
}
