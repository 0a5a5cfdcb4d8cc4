//! Backend-agnostic API over the code-generating backends. Each backend is
//! a value implementing the same capability set {init, shutdown, enumerate
//! devices, compile, launch, sync}; the core dispatches over a sum of the
//! variants instead of trait objects.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::BackendError;
use crate::kernel::{Kernel, ScheduledKernel};
use crate::log::jit_log;
use crate::thread_state::ThreadState;

pub(crate) mod cuda;
pub(crate) mod dummy;
pub(crate) mod llvm;
pub(crate) mod loader;
pub(crate) mod pool;

pub use cuda::Device;
pub use pool::Task;

/// Number of auxiliary non-blocking streams kept per GPU device for
/// overlapping transfer and compute.
pub const SUB_STREAMS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum JitBackend {
    /// GPU backend emitting PTX through the CUDA driver API
    Cuda = 0,
    /// CPU backend emitting IR through the LLVM C API
    Llvm = 1,
    /// Host test device interpreting scheduled kernels
    Dummy = 2,
}

impl JitBackend {
    pub const fn name(self) -> &'static str {
        match self {
            JitBackend::Cuda => "cuda",
            JitBackend::Llvm => "llvm",
            JitBackend::Dummy => "dummy",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn from_u8(x: u8) -> Option<JitBackend> {
        match x {
            0 => Some(JitBackend::Cuda),
            1 => Some(JitBackend::Llvm),
            2 => Some(JitBackend::Dummy),
            _ => None,
        }
    }
}

impl std::fmt::Display for JitBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Page-aligned host allocation shared between the CPU-style backends.
/// Kernel blocks write disjoint element ranges concurrently, so access
/// goes through raw pointers rather than slices.
pub struct HostBuffer {
    ptr: NonNull<u8>,
    bytes: usize,
}

unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    pub fn alloc(bytes: usize) -> Arc<HostBuffer> {
        let bytes = bytes.max(1);
        let layout = Layout::from_size_align(bytes, 64).expect("invalid layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };
        Arc::new(HostBuffer { ptr, bytes })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    /// Copy out; the caller must have synchronized pending writers.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.bytes);
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    pub fn write(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.bytes);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.bytes.max(1), 64).unwrap();
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostBuffer[{}]", self.bytes)
    }
}

/// Owning handle to an evaluated variable's storage.
#[derive(Debug, Clone)]
pub enum Data {
    /// Device allocation; freed through the driver API on release
    Cuda { dptr: u64, bytes: usize, device: usize },
    /// Host allocation shared by the LLVM and dummy backends
    Host(Arc<HostBuffer>),
}

impl Data {
    pub fn bytes(&self) -> usize {
        match self {
            Data::Cuda { bytes, .. } => *bytes,
            Data::Host(buf) => buf.len(),
        }
    }

    /// Pointer value passed as a kernel argument.
    pub fn raw_ptr(&self) -> u64 {
        match self {
            Data::Cuda { dptr, .. } => *dptr,
            Data::Host(buf) => buf.as_ptr() as u64,
        }
    }
}

/// The set of initialized backends, held by the global state record.
/// Backends are reference counted so that blocking calls (syncs, compiles)
/// can run against a clone with the global lock released.
pub struct Backends {
    pub cuda: Option<Arc<cuda::CudaBackend>>,
    pub llvm: Option<Arc<llvm::LlvmBackend>>,
    pub dummy: Option<Arc<dummy::DummyBackend>>,
    /// Embedded CPU task pool, shared by the CPU-style backends
    pub pool: Option<Arc<pool::CpuPool>>,
}

impl Backends {
    pub const fn none() -> Backends {
        Backends { cuda: None, llvm: None, dummy: None, pool: None }
    }

    pub fn has(&self, backend: JitBackend) -> bool {
        match backend {
            JitBackend::Cuda => self.cuda.is_some(),
            JitBackend::Llvm => self.llvm.is_some(),
            JitBackend::Dummy => self.dummy.is_some(),
        }
    }

    /// Device identity folded into every kernel fingerprint. Two kernels
    /// compiled for devices with different keys are distinct.
    pub fn device_key(&self, backend: JitBackend, device: usize) -> String {
        match backend {
            JitBackend::Cuda => {
                self.cuda.as_ref().map(|b| b.device_key(device)).unwrap_or_default()
            }
            JitBackend::Llvm => self.llvm.as_ref().map(|b| b.device_key()).unwrap_or_default(),
            JitBackend::Dummy => dummy::DEVICE_KEY.into(),
        }
    }

    /// Emit textual kernel source into `scratch`. Identical scheduled
    /// kernels produce byte-identical text.
    pub fn emit(&self, kernel: &ScheduledKernel, entry: &str, scratch: &mut String) {
        scratch.clear();
        match kernel.backend {
            JitBackend::Cuda => cuda::emit_ptx(kernel, entry, scratch),
            JitBackend::Llvm => llvm::emit_ir(kernel, entry, scratch),
            JitBackend::Dummy => dummy::emit(kernel, entry, scratch),
        }
    }

    /// Enqueue a compiled kernel. `params` are raw buffer addresses in the
    /// scheduled kernel's argument order.
    pub fn launch(
        &self,
        kernel: &Arc<Kernel>,
        ts: &mut ThreadState,
        params: Vec<LaunchParam>,
        size: u32,
        cpu_block_size: u32,
    ) -> Result<(), BackendError> {
        jit_log!(
            Debug,
            "launch",
            "{} kernel {} with {} args over {} elements",
            kernel.backend.name(),
            kernel.fingerprint.to_hex(),
            params.len(),
            size
        );
        match kernel.backend {
            JitBackend::Cuda => {
                let backend = self.cuda.as_ref().ok_or_else(unavailable)?;
                backend.launch(kernel, ts, &params, size)
            }
            JitBackend::Llvm => {
                let backend = self.llvm.as_ref().ok_or_else(unavailable)?;
                let pool = self.pool.as_ref().ok_or_else(unavailable)?;
                backend.launch(pool, kernel, ts, params, size, cpu_block_size)
            }
            JitBackend::Dummy => {
                let backend = self.dummy.as_ref().ok_or_else(unavailable)?;
                let pool = self.pool.as_ref().ok_or_else(unavailable)?;
                backend.launch(pool, kernel, ts, params, size, cpu_block_size)
            }
        }
    }

    /// Allocate storage for `bytes` on the given backend.
    pub fn alloc(
        &self,
        backend: JitBackend,
        bytes: usize,
        device: usize,
    ) -> Result<Data, BackendError> {
        match backend {
            JitBackend::Cuda => {
                let b = self.cuda.as_ref().ok_or_else(unavailable)?;
                b.alloc(bytes, device)
            }
            JitBackend::Llvm | JitBackend::Dummy => Ok(Data::Host(HostBuffer::alloc(bytes))),
        }
    }

    /// Release storage previously produced by [`Backends::alloc`]. Host
    /// buffers free through their reference count; device memory goes back
    /// through the driver.
    pub fn release(&self, data: Data) {
        jit_log!(Trace, "alloc", "releasing {} bytes", data.bytes());
        match data {
            Data::Cuda { dptr, bytes, device } => {
                if let Some(b) = &self.cuda {
                    b.free(dptr, bytes, device);
                }
            }
            Data::Host(_) => {}
        }
    }

    /// Copy device/host variable contents to host memory. Blocking.
    pub fn copy_to_host(&self, data: &Data, offset: usize, dst: &mut [u8]) -> Result<(), BackendError> {
        match data {
            Data::Cuda { dptr, .. } => {
                let b = self.cuda.as_ref().ok_or_else(unavailable)?;
                b.memcpy_dtoh(*dptr + offset as u64, dst)
            }
            Data::Host(buf) => {
                buf.read(offset, dst);
                Ok(())
            }
        }
    }

    /// Copy host memory into a variable's storage. Blocking.
    pub fn copy_from_host(&self, data: &Data, offset: usize, src: &[u8]) -> Result<(), BackendError> {
        match data {
            Data::Cuda { dptr, .. } => {
                let b = self.cuda.as_ref().ok_or_else(unavailable)?;
                b.memcpy_htod(*dptr + offset as u64, src)
            }
            Data::Host(buf) => {
                buf.write(offset, src);
                Ok(())
            }
        }
    }
}

fn unavailable() -> BackendError {
    BackendError::new(crate::error::ErrorStatus::Initialization, "backend is not initialized")
}

/// One kernel argument: the raw address plus the element count of the
/// buffer behind it (the interpreter bounds broadcasts and masks with it).
#[derive(Debug, Clone, Copy)]
pub struct LaunchParam {
    pub ptr: u64,
    pub size: u32,
}

unsafe impl Send for LaunchParam {}
