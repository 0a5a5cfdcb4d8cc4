//! Process-wide state: one record, one mutex.
//!
//! Everything shared (the variable store, the kernel cache, the thread
//! state list, the backends) lives in [`State`] behind a single mutex.
//! Blocking work (syncs, compiles, user callbacks) runs through
//! [`Lock::unlocked`], the scoped unlock helper; holding the mutex across
//! a blocking wait would deadlock any thread trying to register work.

use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use nanoserde::DeJson;

use crate::backend::{cuda::CudaBackend, dummy::DummyBackend, llvm::LlvmBackend};
use crate::backend::{pool::CpuPool, Backends, Data, JitBackend};
use crate::error::{jit_fail, JitError};
use crate::kernel_cache::KernelCache;
use crate::log::{jit_log, LogLevel};
use crate::thread_state::ThreadState;
use crate::var::{Collected, VarStore};

/// Elements per CPU work item.
pub(crate) const DEFAULT_CPU_BLOCK_SIZE: u32 = 16384;

pub struct State {
    pub vars: VarStore,
    pub kernel_cache: KernelCache,
    pub backends: Backends,
    pub thread_states: Vec<Arc<Mutex<ThreadState>>>,
    pub cpu_block_size: u32,
    /// Bumped on every shutdown so cached thread-state handles expire
    pub epoch: u64,
    pub shutdown_in_progress: bool,
    pub initialized: bool,
}

impl State {
    fn new() -> State {
        State {
            vars: VarStore::new(),
            kernel_cache: KernelCache::new(),
            backends: Backends::none(),
            thread_states: Vec::new(),
            cpu_block_size: DEFAULT_CPU_BLOCK_SIZE,
            epoch: 0,
            shutdown_in_progress: false,
            initialized: false,
        }
    }
}

static STATE: LazyLock<Mutex<State>> = LazyLock::new(|| Mutex::new(State::new()));

/// Holder of the global mutex with an explicit unlock scope. The
/// `unlocked` helper is the only way code in this crate releases the lock
/// mid-operation; open-coded unlock/lock pairs are not used.
pub(crate) struct Lock {
    guard: Option<MutexGuard<'static, State>>,
}

impl Lock {
    pub fn acquire() -> Lock {
        let guard = STATE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Lock { guard: Some(guard) }
    }

    /// Release the mutex for the duration of `f`, re-acquiring afterwards.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.guard = None;
        let result = f();
        self.guard = Some(STATE.lock().unwrap_or_else(std::sync::PoisonError::into_inner));
        result
    }
}

impl std::ops::Deref for Lock {
    type Target = State;
    fn deref(&self) -> &State {
        self.guard.as_ref().expect("state lock is released")
    }
}

impl std::ops::DerefMut for Lock {
    fn deref_mut(&mut self) -> &mut State {
        self.guard.as_mut().expect("state lock is released")
    }
}

// ---------------------------------------------------------------------------
// Configuration (ambient; `$HOME/.enoki/config.json`)

#[derive(Debug, Default, DeJson)]
struct CudaConfig {
    device_ids: Option<Vec<i32>>,
}

#[derive(Debug, Default, DeJson)]
struct DummyConfig {
    enabled: bool,
}

#[derive(Debug, Default, DeJson)]
struct Config {
    cuda: Option<CudaConfig>,
    dummy: Option<DummyConfig>,
    cpu_block_size: Option<u32>,
    log_level: Option<String>,
}

fn read_config(dir: Option<&PathBuf>) -> Config {
    let Some(dir) = dir else {
        return Config::default();
    };
    let path = dir.join("config.json");
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Config::default();
    };
    match DeJson::deserialize_json(&text) {
        Ok(config) => config,
        Err(err) => {
            jit_log!(Warn, "init", "failed to parse \"{}\": {err}", path.display());
            Config::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Init / shutdown

/// Initialize the JIT: resolve backends, enumerate devices, attach the
/// on-disk kernel store. Idempotent; later calls are no-ops.
pub(crate) fn init(lock: &mut Lock, llvm: bool, cuda: bool, dummy: bool) -> Result<(), JitError> {
    if lock.initialized {
        return Ok(());
    }
    // Claim initialization before the lock is released for library loading
    // so a concurrent init returns instead of racing the discovery below
    lock.initialized = true;

    let cache_dir = crate::kernel_cache::default_cache_dir();
    let config = read_config(cache_dir.as_ref());
    if let Some(level) = &config.log_level {
        let level = match level.as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        };
        crate::log::set_log_level_stderr(level);
    }
    if let Some(block) = config.cpu_block_size {
        lock.cpu_block_size = block.max(1);
    }

    jit_log!(Info, "init", "detecting devices ..");

    // Library loads and device enumeration may block on the OS; none of it
    // touches the variable store, so run without the lock.
    let device_ids = config.cuda.as_ref().and_then(|c| c.device_ids.clone());
    let dummy_enabled = dummy || config.dummy.as_ref().map(|d| d.enabled).unwrap_or(false);
    let (cuda_backend, llvm_backend) = lock.unlocked(|| {
        let cuda_backend = if cuda { CudaBackend::init(device_ids.as_deref()) } else { None };
        let llvm_backend = if llvm { LlvmBackend::init() } else { None };
        (cuda_backend, llvm_backend)
    });

    lock.backends.cuda = cuda_backend.map(Arc::new);
    lock.backends.llvm = llvm_backend.map(Arc::new);
    lock.backends.dummy = if dummy_enabled { Some(Arc::new(DummyBackend::init())) } else { None };
    if lock.backends.llvm.is_some() || lock.backends.dummy.is_some() {
        lock.backends.pool = Some(Arc::new(CpuPool::new()));
    }

    if let Some(dir) = cache_dir {
        lock.kernel_cache.attach_disk(dir);
    }

    lock.shutdown_in_progress = false;
    Ok(())
}

/// Release all resources and report reference leaks. Returns
/// `LeakDetected` when live variables remain after reconciliation.
pub(crate) fn shutdown(lock: &mut Lock) -> Result<(), JitError> {
    if !lock.initialized {
        return Ok(());
    }
    lock.shutdown_in_progress = true;

    // Drain thread states: sync outstanding work with the lock released,
    // then destroy streams/events and flush pending buffer releases.
    let tss: Vec<_> = lock.thread_states.drain(..).collect();
    if !tss.is_empty() {
        jit_log!(
            Info,
            "shutdown",
            "releasing {} thread state{}",
            tss.len(),
            if tss.len() > 1 { "s" } else { "" }
        );
    }
    for ts_arc in tss {
        sync_one(lock, &ts_arc);
        let mut ts = ts_arc.lock().unwrap();
        let chain = std::mem::take(&mut ts.release_chain);
        if ts.backend == JitBackend::Cuda {
            if let Some(cuda) = &lock.backends.cuda {
                cuda.destroy_stream_event(ts.device, ts.stream.cast(), ts.event.cast());
            }
        }
        let leftover_effects = std::mem::take(&mut ts.side_effects);
        drop(ts);
        for data in chain {
            lock.backends.release(data);
        }
        // Side effects that were never demanded lose their list reference
        let mut collected = Collected::default();
        for id in leftover_effects {
            lock.vars.dec_ref_ext(id, &mut collected);
        }
        process_collected(lock, collected);
    }
    lock.epoch += 1;

    // Tear down the kernel cache; CUDA modules go back through the driver
    let kernels = lock.kernel_cache.teardown();
    if !kernels.is_empty() {
        jit_log!(
            Info,
            "shutdown",
            "releasing {} kernel{}",
            kernels.len(),
            if kernels.len() > 1 { "s" } else { "" }
        );
    }
    for kernel in kernels {
        if let Some(cuda) = &lock.backends.cuda {
            cuda.release_program(&kernel.program);
        }
    }

    // Leak pass (a): scatter variables whose only remaining reference is
    // the single external one are structural garbage once nothing can
    // observe their result anymore.
    let orphans: Vec<_> = lock
        .vars
        .iter()
        .filter(|(_, v)| v.scatter && v.ref_count_ext == 1 && v.ref_count_int == 0)
        .map(|(id, _)| id)
        .collect();
    let mut collected = Collected::default();
    for id in orphans {
        lock.vars.dec_ref_ext(id, &mut collected);
    }
    process_collected(lock, collected);

    // Leak pass (b): everything still alive is a leak
    let mut leaked: Vec<_> = lock.vars.iter().map(|(id, _)| id).collect();
    leaked.sort_unstable();
    let n_leaked = leaked.len();
    if n_leaked > 0 {
        jit_log!(Warn, "shutdown", "detected variable leaks:");
        for (n, id) in leaked.iter().enumerate() {
            if n < 10 {
                jit_log!(Warn, "shutdown", " - {}", lock.vars.var_summary(*id));
            } else {
                jit_log!(Warn, "shutdown", " - (skipping remainder)");
                break;
            }
        }
        jit_log!(Warn, "shutdown", "{n_leaked} variables are still referenced");
    }

    if n_leaked == 0 && lock.vars.cse_len() != 0 {
        jit_fail!("shutdown(): the CSE cache is non-empty but no variables remain");
    }
    if n_leaked == 0 && lock.vars.extra_len() != 0 {
        jit_log!(Warn, "shutdown", "{} side-table records were not cleaned up", lock.vars.extra_len());
    }

    // All thread states were drained above, so no transient backend
    // references remain and unwrapping the reference counts succeeds.
    if let Some(cuda) = lock.backends.cuda.take() {
        match Arc::try_unwrap(cuda) {
            Ok(mut cuda) => cuda.shutdown(),
            Err(_) => jit_log!(Warn, "shutdown", "CUDA backend still referenced, leaking it"),
        }
    }
    if let Some(llvm) = lock.backends.llvm.take() {
        match Arc::try_unwrap(llvm) {
            Ok(mut llvm) => llvm.shutdown(),
            Err(_) => jit_log!(Warn, "shutdown", "LLVM backend still referenced, leaking it"),
        }
    }
    lock.backends.dummy = None;
    let pool = lock.backends.pool.take();
    lock.unlocked(move || drop(pool));

    jit_log!(Info, "shutdown", "done (peak variable count: {})", lock.vars.watermark());
    lock.vars = VarStore::new();
    lock.initialized = false;
    lock.shutdown_in_progress = false;

    if n_leaked > 0 {
        Err(JitError::LeakDetected { leaked: n_leaked })
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Thread states

thread_local! {
    static TS_CACHE: RefCell<[Option<(u64, Arc<Mutex<ThreadState>>)>; 3]> =
        const { RefCell::new([None, None, None]) };
}

/// Thread state of the calling thread for `backend` when one already
/// exists; never creates one.
pub(crate) fn existing_thread_state(
    lock: &Lock,
    backend: JitBackend,
) -> Option<Arc<Mutex<ThreadState>>> {
    let epoch = lock.epoch;
    TS_CACHE.with(|cache| {
        cache.borrow()[backend.index()]
            .clone()
            .filter(|(ts_epoch, _)| *ts_epoch == epoch)
            .map(|(_, ts)| ts)
    })
}

/// Thread state of the calling thread for `backend`; created and
/// registered on first request.
pub(crate) fn thread_state(
    lock: &mut Lock,
    backend: JitBackend,
) -> Result<Arc<Mutex<ThreadState>>, JitError> {
    let epoch = lock.epoch;
    let cached = TS_CACHE.with(|cache| cache.borrow()[backend.index()].clone());
    if let Some((ts_epoch, ts)) = cached {
        if ts_epoch == epoch {
            return Ok(ts);
        }
    }

    if lock.shutdown_in_progress {
        return Err(JitError::ShutdownInProgress);
    }
    if !lock.backends.has(backend) {
        let hint = match backend {
            JitBackend::Cuda => {
                "the CUDA backend is inactive because the driver library (\"libcuda.so\") \
                 could not be found or exposed no usable devices; set ENOKI_LIBCUDA_PATH \
                 to specify its path"
            }
            JitBackend::Llvm => {
                "the LLVM backend is inactive because the shared library (\"libLLVM.so\") \
                 could not be found; set ENOKI_LIBLLVM_PATH to specify its path"
            }
            JitBackend::Dummy => "the host test device is not enabled",
        };
        return Err(JitError::BackendUnavailable(hint.into()));
    }

    let mut ts = ThreadState::new(backend);
    if backend == JitBackend::Cuda {
        let cuda = lock.backends.cuda.as_ref().unwrap();
        ts.device = 0;
        ts.context = cuda.devices[0].context.cast();
        let (stream, event) = cuda.create_stream_event(0)?;
        ts.stream = stream.cast();
        ts.event = event.cast();
    }
    let ts = Arc::new(Mutex::new(ts));
    lock.thread_states.push(ts.clone());
    TS_CACHE.with(|cache| cache.borrow_mut()[backend.index()] = Some((epoch, ts.clone())));
    jit_log!(Debug, "init", "created {} thread state", backend.name());
    Ok(ts)
}

/// Switch the calling thread's GPU state to another device: synchronize
/// and destroy the old stream/event, adopt the new context, create a
/// fresh pair.
pub(crate) fn cuda_set_device(lock: &mut Lock, device: usize) -> Result<(), JitError> {
    let count = lock.backends.cuda.as_ref().map(|c| c.device_count()).unwrap_or(0);
    if device >= count {
        return Err(JitError::DeviceIndexOutOfRange { index: device, count });
    }
    let ts_arc = thread_state(lock, JitBackend::Cuda)?;
    let mut ts = ts_arc.lock().unwrap();
    if ts.device == device {
        return Ok(());
    }
    jit_log!(Info, "cuda", "set_device({device})");
    let cuda = lock.backends.cuda.as_ref().unwrap();
    cuda.destroy_stream_event(ts.device, ts.stream.cast(), ts.event.cast());
    ts.device = device;
    ts.context = cuda.devices[device].context.cast();
    let (stream, event) = cuda.create_stream_event(device)?;
    ts.stream = stream.cast();
    ts.event = event.cast();
    Ok(())
}

// ---------------------------------------------------------------------------
// Synchronization

/// Wait for one thread state's outstanding work; the global lock is
/// released for the duration of the wait.
fn sync_one(lock: &mut Lock, ts_arc: &Arc<Mutex<ThreadState>>) {
    let (backend, device, stream, task) = {
        let ts = ts_arc.lock().unwrap();
        (ts.backend, ts.device, ts.stream as usize, ts.task.clone())
    };
    match backend {
        JitBackend::Cuda => {
            if let Some(cuda) = lock.backends.cuda.clone() {
                let result = lock.unlocked(|| cuda.sync_stream(device, stream as *mut _));
                if let Err(err) = result {
                    jit_log!(Warn, "sync", "stream sync failed: {err}");
                }
            }
        }
        JitBackend::Llvm | JitBackend::Dummy => {
            if let Some(task) = task {
                lock.unlocked(|| task.wait());
            }
        }
    }
    flush_release_chain(lock, ts_arc);
}

/// Release buffers that were waiting for stream completion.
fn flush_release_chain(lock: &mut Lock, ts_arc: &Arc<Mutex<ThreadState>>) {
    let chain = {
        let mut ts = ts_arc.lock().unwrap();
        std::mem::take(&mut ts.release_chain)
    };
    for data in chain {
        lock.backends.release(data);
    }
}

/// Wait for the calling thread's outstanding work on every backend.
pub(crate) fn sync_thread(lock: &mut Lock) {
    let epoch = lock.epoch;
    let cached: Vec<_> = TS_CACHE.with(|cache| {
        cache
            .borrow()
            .iter()
            .flatten()
            .filter(|(ts_epoch, _)| *ts_epoch == epoch)
            .map(|(_, ts)| ts.clone())
            .collect()
    });
    for ts_arc in cached {
        sync_one(lock, &ts_arc);
    }
}

/// Wait for all work on the current GPU device's context and on every
/// CPU-style thread state.
pub(crate) fn sync_device(lock: &mut Lock) {
    let epoch = lock.epoch;
    let cuda_ts = TS_CACHE.with(|cache| {
        cache.borrow()[JitBackend::Cuda.index()]
            .clone()
            .filter(|(ts_epoch, _)| *ts_epoch == epoch)
            .map(|(_, ts)| ts)
    });
    if let Some(ts_arc) = cuda_ts {
        let device = ts_arc.lock().unwrap().device;
        if let Some(cuda) = lock.backends.cuda.clone() {
            // Context-wide sync covers every stream on the device
            let result = lock.unlocked(|| cuda.sync_context(device));
            if let Err(err) = result {
                jit_log!(Warn, "sync", "device sync failed: {err}");
            }
        }
        flush_release_chain(lock, &ts_arc);
    }

    let snapshot: Vec<_> = lock
        .thread_states
        .iter()
        .filter(|ts| {
            let backend = ts.lock().unwrap().backend;
            backend != JitBackend::Cuda
        })
        .cloned()
        .collect();
    for ts_arc in snapshot {
        sync_one(lock, &ts_arc);
    }
}

/// Wait for every registered thread state.
pub(crate) fn sync_all(lock: &mut Lock) {
    let snapshot: Vec<_> = lock.thread_states.clone();
    for ts_arc in snapshot {
        sync_one(lock, &ts_arc);
    }
}

// ---------------------------------------------------------------------------
// Collection plumbing

/// Dispose what a collection pass produced: buffers go back to their
/// backend (device memory joins the release chain of the current CUDA
/// thread state when one exists), free-callbacks run with the lock
/// released unless marked internal.
pub(crate) fn process_collected(lock: &mut Lock, collected: Collected) {
    let Collected { buffers, callbacks } = collected;
    for data in buffers {
        match &data {
            Data::Cuda { .. } => {
                let epoch = lock.epoch;
                let cuda_ts = TS_CACHE.with(|cache| {
                    cache.borrow()[JitBackend::Cuda.index()]
                        .clone()
                        .filter(|(ts_epoch, _)| *ts_epoch == epoch)
                        .map(|(_, ts)| ts)
                });
                match cuda_ts {
                    Some(ts_arc) => ts_arc.lock().unwrap().release_chain.push(data),
                    None => lock.backends.release(data),
                }
            }
            Data::Host(_) => {}
        }
    }
    for (id, callback) in callbacks {
        lock.unlocked(|| callback(id));
    }
}
