//! Per-thread, per-backend execution contexts.
//!
//! Exactly one `ThreadState` exists per (thread, backend) pair. The global
//! record owns them; thread-local storage caches a handle so the common
//! path is a single lookup. GPU states own their stream and event, CPU
//! states own the handle of their most recent task.

use std::ffi::c_void;
use std::ptr;

use crate::backend::{Data, JitBackend, Task};
use crate::var::VarId;

pub struct ThreadState {
    pub backend: JitBackend,
    /// Selected device (GPU only)
    pub device: usize,
    /// Primary context of the selected device (GPU only)
    pub context: *mut c_void,
    pub stream: *mut c_void,
    pub event: *mut c_void,
    /// Most recent task submitted to the CPU pool. The dispatcher is
    /// FIFO, so this handle transitively covers earlier launches.
    pub task: Option<Task>,
    /// Buffers whose release waits for outstanding stream work
    pub release_chain: Vec<Data>,
    /// Variables marked for the next evaluation
    pub scheduled: Vec<VarId>,
    /// Side-effecting variables awaiting materialization; each entry owns
    /// one external reference until it is launched
    pub side_effects: Vec<VarId>,
    /// Scratch buffer reused by the code generators
    pub scratch: String,
}

// Stream/context/event handles are thread-affine by convention; the global
// lock serializes the registration and teardown paths that cross threads.
unsafe impl Send for ThreadState {}

impl ThreadState {
    pub fn new(backend: JitBackend) -> ThreadState {
        ThreadState {
            backend,
            device: 0,
            context: ptr::null_mut(),
            stream: ptr::null_mut(),
            event: ptr::null_mut(),
            task: None,
            release_chain: Vec::new(),
            scheduled: Vec::new(),
            side_effects: Vec::new(),
            scratch: String::with_capacity(4096),
        }
    }
}
