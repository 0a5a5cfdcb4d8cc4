//! GPU backend speaking to the CUDA driver API resolved at runtime.
//!
//! The driver library is located dynamically; every entry point the core
//! may call lives in [`CudaApi`] as an optional function pointer populated
//! by a single resolve pass. Capability predicates inspect which fields
//! resolved; a driver missing the core group shuts the backend down
//! cleanly instead of crashing at the first call.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::ptr;
use std::sync::Arc;

use libloading::Library;

use super::loader::find_library;
use super::{Data, LaunchParam, SUB_STREAMS};
use crate::error::{BackendError, ErrorStatus};
use crate::kernel::{Kernel, KernelOp, Program, ScheduledKernel, Slot, UNMASKED};
use crate::log::jit_log;
use crate::op::Op;
use crate::thread_state::ThreadState;

#[repr(C)]
pub(crate) struct CUctx_st {
    _unused: [u8; 0],
}
pub(crate) type CUcontext = *mut CUctx_st;
pub(crate) type CUdevice = c_int;
pub(crate) type CUdeviceptr = u64;
#[repr(C)]
pub(crate) struct CUstream_st {
    _unused: [u8; 0],
}
pub(crate) type CUstream = *mut CUstream_st;
#[repr(C)]
pub(crate) struct CUevent_st {
    _unused: [u8; 0],
}
pub(crate) type CUevent = *mut CUevent_st;
#[repr(C)]
pub(crate) struct CUmod_st {
    _unused: [u8; 0],
}
pub(crate) type CUmodule = *mut CUmod_st;
#[repr(C)]
pub(crate) struct CUfunc_st {
    _unused: [u8; 0],
}
pub(crate) type CUfunction = *mut CUfunc_st;

type CUresult = c_int;

const CUDA_SUCCESS: CUresult = 0;
const CUDA_ERROR_PEER_ACCESS_ALREADY_ENABLED: CUresult = 704;

const CU_STREAM_NON_BLOCKING: c_uint = 1;
const CU_EVENT_DISABLE_TIMING: c_uint = 2;

#[allow(unused)]
#[repr(i32)]
enum CUdevice_attribute {
    MultiprocessorCount = 16,
    UnifiedAddressing = 41,
    ComputeCapabilityMajor = 75,
    ComputeCapabilityMinor = 76,
    ManagedMemory = 83,
    MaxSharedMemoryPerBlockOptin = 97,
}

trait Check {
    fn check(self, status: ErrorStatus, context: &str) -> Result<(), BackendError>;
}

impl Check for CUresult {
    fn check(self, status: ErrorStatus, context: &str) -> Result<(), BackendError> {
        if self == CUDA_SUCCESS {
            Ok(())
        } else {
            Err(BackendError::new(status, format!("{context} (CUresult = {self})")))
        }
    }
}

/// Typed function pointers into the driver library, resolved once.
#[allow(non_snake_case)]
#[derive(Default)]
pub(crate) struct CudaApi {
    cuInit: Option<unsafe extern "C" fn(c_uint) -> CUresult>,
    cuDriverGetVersion: Option<unsafe extern "C" fn(*mut c_int) -> CUresult>,
    cuDeviceGetCount: Option<unsafe extern "C" fn(*mut c_int) -> CUresult>,
    cuDeviceGet: Option<unsafe extern "C" fn(*mut CUdevice, c_int) -> CUresult>,
    cuDeviceGetName: Option<unsafe extern "C" fn(*mut c_char, c_int, CUdevice) -> CUresult>,
    cuDeviceGetAttribute: Option<unsafe extern "C" fn(*mut c_int, c_int, CUdevice) -> CUresult>,
    cuDeviceTotalMem: Option<unsafe extern "C" fn(*mut usize, CUdevice) -> CUresult>,
    cuDevicePrimaryCtxRetain: Option<unsafe extern "C" fn(*mut CUcontext, CUdevice) -> CUresult>,
    cuDevicePrimaryCtxRelease: Option<unsafe extern "C" fn(CUdevice) -> CUresult>,
    cuCtxSetCurrent: Option<unsafe extern "C" fn(CUcontext) -> CUresult>,
    cuCtxSynchronize: Option<unsafe extern "C" fn() -> CUresult>,
    cuStreamCreate: Option<unsafe extern "C" fn(*mut CUstream, c_uint) -> CUresult>,
    cuStreamDestroy: Option<unsafe extern "C" fn(CUstream) -> CUresult>,
    cuStreamSynchronize: Option<unsafe extern "C" fn(CUstream) -> CUresult>,
    cuEventCreate: Option<unsafe extern "C" fn(*mut CUevent, c_uint) -> CUresult>,
    cuEventDestroy: Option<unsafe extern "C" fn(CUevent) -> CUresult>,
    cuEventRecord: Option<unsafe extern "C" fn(CUevent, CUstream) -> CUresult>,
    cuModuleLoadDataEx: Option<
        unsafe extern "C" fn(
            *mut CUmodule,
            *const c_void,
            c_uint,
            *mut c_int,
            *mut *mut c_void,
        ) -> CUresult,
    >,
    cuModuleGetFunction:
        Option<unsafe extern "C" fn(*mut CUfunction, CUmodule, *const c_char) -> CUresult>,
    cuModuleUnload: Option<unsafe extern "C" fn(CUmodule) -> CUresult>,
    cuLaunchKernel: Option<
        unsafe extern "C" fn(
            CUfunction,
            c_uint,
            c_uint,
            c_uint,
            c_uint,
            c_uint,
            c_uint,
            c_uint,
            CUstream,
            *mut *mut c_void,
            *mut *mut c_void,
        ) -> CUresult,
    >,
    cuMemAlloc: Option<unsafe extern "C" fn(*mut CUdeviceptr, usize) -> CUresult>,
    cuMemFree: Option<unsafe extern "C" fn(CUdeviceptr) -> CUresult>,
    cuMemcpyHtoD: Option<unsafe extern "C" fn(CUdeviceptr, *const c_void, usize) -> CUresult>,
    cuMemcpyDtoH: Option<unsafe extern "C" fn(*mut c_void, CUdeviceptr, usize) -> CUresult>,
    cuDeviceCanAccessPeer:
        Option<unsafe extern "C" fn(*mut c_int, CUdevice, CUdevice) -> CUresult>,
    cuCtxEnablePeerAccess: Option<unsafe extern "C" fn(CUcontext, c_uint) -> CUresult>,
}

macro_rules! resolve {
    ($lib:expr, $name:literal) => {{
        // Prefer the _v2 entry point where the driver exports one
        let v2 = concat!($name, "_v2\0");
        let v1 = concat!($name, "\0");
        unsafe {
            $lib.get(v2.as_bytes())
                .or_else(|_| $lib.get(v1.as_bytes()))
                .ok()
                .map(|sym| *sym)
        }
    }};
}

impl CudaApi {
    fn resolve(lib: &Library) -> CudaApi {
        CudaApi {
            cuInit: resolve!(lib, "cuInit"),
            cuDriverGetVersion: resolve!(lib, "cuDriverGetVersion"),
            cuDeviceGetCount: resolve!(lib, "cuDeviceGetCount"),
            cuDeviceGet: resolve!(lib, "cuDeviceGet"),
            cuDeviceGetName: resolve!(lib, "cuDeviceGetName"),
            cuDeviceGetAttribute: resolve!(lib, "cuDeviceGetAttribute"),
            cuDeviceTotalMem: resolve!(lib, "cuDeviceTotalMem"),
            cuDevicePrimaryCtxRetain: resolve!(lib, "cuDevicePrimaryCtxRetain"),
            cuDevicePrimaryCtxRelease: resolve!(lib, "cuDevicePrimaryCtxRelease"),
            cuCtxSetCurrent: resolve!(lib, "cuCtxSetCurrent"),
            cuCtxSynchronize: resolve!(lib, "cuCtxSynchronize"),
            cuStreamCreate: resolve!(lib, "cuStreamCreate"),
            cuStreamDestroy: resolve!(lib, "cuStreamDestroy"),
            cuStreamSynchronize: resolve!(lib, "cuStreamSynchronize"),
            cuEventCreate: resolve!(lib, "cuEventCreate"),
            cuEventDestroy: resolve!(lib, "cuEventDestroy"),
            cuEventRecord: resolve!(lib, "cuEventRecord"),
            cuModuleLoadDataEx: resolve!(lib, "cuModuleLoadDataEx"),
            cuModuleGetFunction: resolve!(lib, "cuModuleGetFunction"),
            cuModuleUnload: resolve!(lib, "cuModuleUnload"),
            cuLaunchKernel: resolve!(lib, "cuLaunchKernel"),
            cuMemAlloc: resolve!(lib, "cuMemAlloc"),
            cuMemFree: resolve!(lib, "cuMemFree"),
            cuMemcpyHtoD: resolve!(lib, "cuMemcpyHtoD"),
            cuMemcpyDtoH: resolve!(lib, "cuMemcpyDtoH"),
            cuDeviceCanAccessPeer: resolve!(lib, "cuDeviceCanAccessPeer"),
            cuCtxEnablePeerAccess: resolve!(lib, "cuCtxEnablePeerAccess"),
        }
    }

    /// True when every symbol the core unconditionally calls resolved.
    fn has_core(&self) -> bool {
        self.cuInit.is_some()
            && self.cuDeviceGetCount.is_some()
            && self.cuDeviceGet.is_some()
            && self.cuDeviceGetName.is_some()
            && self.cuDeviceGetAttribute.is_some()
            && self.cuDeviceTotalMem.is_some()
            && self.cuDevicePrimaryCtxRetain.is_some()
            && self.cuDevicePrimaryCtxRelease.is_some()
            && self.cuCtxSetCurrent.is_some()
            && self.cuCtxSynchronize.is_some()
            && self.cuStreamCreate.is_some()
            && self.cuStreamDestroy.is_some()
            && self.cuStreamSynchronize.is_some()
            && self.cuEventCreate.is_some()
            && self.cuEventDestroy.is_some()
            && self.cuEventRecord.is_some()
            && self.cuModuleLoadDataEx.is_some()
            && self.cuModuleGetFunction.is_some()
            && self.cuModuleUnload.is_some()
            && self.cuLaunchKernel.is_some()
            && self.cuMemAlloc.is_some()
            && self.cuMemFree.is_some()
            && self.cuMemcpyHtoD.is_some()
            && self.cuMemcpyDtoH.is_some()
    }

    fn has_p2p(&self) -> bool {
        self.cuDeviceCanAccessPeer.is_some() && self.cuCtxEnablePeerAccess.is_some()
    }
}

/// One accepted GPU. The registry is read-mostly after init; the peer
/// matrix and the sub-stream pool are configured once and read without
/// further coordination.
pub struct Device {
    pub id: CUdevice,
    pub name: String,
    pub context: CUcontext,
    /// major * 10 + minor
    pub compute_capability: u32,
    pub num_sm: u32,
    pub shared_memory_bytes: u32,
    pub mem_total: usize,
    pub sub_streams: Vec<CUstream>,
    pub sub_events: Vec<CUevent>,
    /// peer_enabled[j]: access from this device's context to device j
    pub peer_enabled: Vec<bool>,
}

unsafe impl Send for Device {}

pub struct CudaBackend {
    #[allow(unused)]
    lib: Arc<Library>,
    api: CudaApi,
    pub devices: Vec<Device>,
    pub driver_version: i32,
}

unsafe impl Send for CudaBackend {}
unsafe impl Sync for CudaBackend {}

impl CudaBackend {
    /// Locate the driver, resolve its API, enumerate usable devices, and
    /// wire up the peer-to-peer matrix. `None` leaves the backend disabled.
    pub fn init(device_ids: Option<&[i32]>) -> Option<CudaBackend> {
        let lib = find_library(
            "libcuda.so",
            &["/usr/lib/x86_64-linux-gnu", "/usr/lib64", "/usr/lib", "/opt/cuda/lib64"],
            "ENOKI_LIBCUDA_PATH",
        )?;
        let api = CudaApi::resolve(&lib);
        if !api.has_core() {
            jit_log!(
                Warn,
                "cuda",
                "detected driver lacks the core API used by the JIT, shutting down CUDA backend"
            );
            return None;
        }

        let status = unsafe { (api.cuInit.unwrap())(0) };
        if status != CUDA_SUCCESS {
            jit_log!(Warn, "cuda", "cuInit failed (CUresult = {status})");
            return None;
        }

        let mut driver_version = 0;
        if let Some(get_version) = api.cuDriverGetVersion {
            unsafe { get_version(&mut driver_version) };
        }

        let mut count = 0;
        if unsafe { (api.cuDeviceGetCount.unwrap())(&mut count) } != CUDA_SUCCESS || count == 0 {
            jit_log!(Info, "cuda", "no CUDA devices found");
            return None;
        }

        let mut backend =
            CudaBackend { lib: Arc::new(lib), api, devices: Vec::new(), driver_version };
        if let Err(err) = backend.enumerate(count, device_ids) {
            jit_log!(Warn, "cuda", "device enumeration failed: {err}");
            return None;
        }
        if backend.devices.is_empty() {
            jit_log!(Info, "cuda", "no usable CUDA devices after filtering");
            return None;
        }
        backend.enable_peer_access();
        jit_log!(
            Info,
            "cuda",
            "using CUDA driver {}.{} with {} device{}",
            backend.driver_version / 1000,
            (backend.driver_version % 1000) / 10,
            backend.devices.len(),
            if backend.devices.len() == 1 { "" } else { "s" }
        );
        Some(backend)
    }

    fn attr(&self, attr: CUdevice_attribute, dev: CUdevice) -> Result<c_int, BackendError> {
        let mut value = 0;
        unsafe { (self.api.cuDeviceGetAttribute.unwrap())(&mut value, attr as c_int, dev) }
            .check(ErrorStatus::DeviceQuery, "cuDeviceGetAttribute failed")?;
        Ok(value)
    }

    /// Accept devices that support unified addressing and managed memory;
    /// retain a primary context and a fixed pool of non-blocking
    /// sub-streams with disable-timing events for each one.
    fn enumerate(&mut self, count: c_int, device_ids: Option<&[i32]>) -> Result<(), BackendError> {
        let api = &self.api;
        for i in 0..count {
            if let Some(ids) = device_ids {
                if !ids.contains(&i) {
                    continue;
                }
            }
            let mut dev = 0;
            unsafe { (api.cuDeviceGet.unwrap())(&mut dev, i) }
                .check(ErrorStatus::DeviceEnumeration, "cuDeviceGet failed")?;
            let mut name_buf = [0 as c_char; 256];
            unsafe { (api.cuDeviceGetName.unwrap())(name_buf.as_mut_ptr(), 256, dev) }
                .check(ErrorStatus::DeviceQuery, "cuDeviceGetName failed")?;
            let name = unsafe { CStr::from_ptr(name_buf.as_ptr()) }.to_string_lossy().into_owned();

            let unified = self.attr(CUdevice_attribute::UnifiedAddressing, dev)?;
            let managed = self.attr(CUdevice_attribute::ManagedMemory, dev)?;
            let cc_major = self.attr(CUdevice_attribute::ComputeCapabilityMajor, dev)?;
            let cc_minor = self.attr(CUdevice_attribute::ComputeCapabilityMinor, dev)?;
            let num_sm = self.attr(CUdevice_attribute::MultiprocessorCount, dev)?;
            let shared = self.attr(CUdevice_attribute::MaxSharedMemoryPerBlockOptin, dev)?;
            let mut mem_total = 0usize;
            unsafe { (api.cuDeviceTotalMem.unwrap())(&mut mem_total, dev) }
                .check(ErrorStatus::DeviceQuery, "cuDeviceTotalMem failed")?;

            jit_log!(
                Info,
                "cuda",
                "found device {i}: \"{name}\" (compute cap. {cc_major}.{cc_minor}, {num_sm} SMs)"
            );

            if unified == 0 {
                jit_log!(Warn, "cuda", "device {i} does not support unified addressing, skipping");
                continue;
            }
            if managed == 0 {
                jit_log!(Warn, "cuda", "device {i} does not support managed memory, skipping");
                continue;
            }

            let mut context: CUcontext = ptr::null_mut();
            unsafe { (api.cuDevicePrimaryCtxRetain.unwrap())(&mut context, dev) }
                .check(ErrorStatus::Initialization, "cuDevicePrimaryCtxRetain failed")?;
            unsafe { (api.cuCtxSetCurrent.unwrap())(context) }
                .check(ErrorStatus::Initialization, "cuCtxSetCurrent failed")?;

            let mut sub_streams = Vec::with_capacity(SUB_STREAMS);
            let mut sub_events = Vec::with_capacity(SUB_STREAMS);
            for _ in 0..SUB_STREAMS {
                let mut stream: CUstream = ptr::null_mut();
                unsafe { (api.cuStreamCreate.unwrap())(&mut stream, CU_STREAM_NON_BLOCKING) }
                    .check(ErrorStatus::Initialization, "cuStreamCreate failed")?;
                let mut event: CUevent = ptr::null_mut();
                unsafe { (api.cuEventCreate.unwrap())(&mut event, CU_EVENT_DISABLE_TIMING) }
                    .check(ErrorStatus::Initialization, "cuEventCreate failed")?;
                sub_streams.push(stream);
                sub_events.push(event);
            }

            self.devices.push(Device {
                id: dev,
                name,
                context,
                compute_capability: (cc_major * 10 + cc_minor) as u32,
                num_sm: num_sm as u32,
                shared_memory_bytes: shared as u32,
                mem_total,
                sub_streams,
                sub_events,
                peer_enabled: Vec::new(),
            });
        }
        Ok(())
    }

    /// Enable peer access for every ordered pair that reports support.
    /// Both directions are attempted; an asymmetric failure is logged and
    /// leaves the working direction enabled. Already-enabled results are
    /// idempotent.
    fn enable_peer_access(&mut self) {
        if !self.api.has_p2p() {
            for i in 0..self.devices.len() {
                self.devices[i].peer_enabled = vec![false; self.devices.len()];
            }
            return;
        }
        let api = &self.api;
        let n = self.devices.len();
        let mut matrix = vec![vec![false; n]; n];
        for a in 0..n {
            for b in 0..n {
                if a == b {
                    continue;
                }
                let mut ok = 0;
                let status = unsafe {
                    (api.cuDeviceCanAccessPeer.unwrap())(
                        &mut ok,
                        self.devices[a].id,
                        self.devices[b].id,
                    )
                };
                if status != CUDA_SUCCESS || ok == 0 {
                    continue;
                }
                unsafe { (api.cuCtxSetCurrent.unwrap())(self.devices[a].context) };
                let rv = unsafe { (api.cuCtxEnablePeerAccess.unwrap())(self.devices[b].context, 0) };
                if rv == CUDA_SUCCESS || rv == CUDA_ERROR_PEER_ACCESS_ALREADY_ENABLED {
                    jit_log!(Debug, "cuda", "enabled peer access {a} -> {b}");
                    matrix[a][b] = true;
                } else {
                    jit_log!(Warn, "cuda", "asymmetric peer access {a} -> {b} (CUresult = {rv})");
                }
            }
        }
        for (i, row) in matrix.into_iter().enumerate() {
            self.devices[i].peer_enabled = row;
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Whether peer access from device `a`'s context to device `b` was
    /// established at init. Read-only after init, no locking required.
    pub fn peer_accessible(&self, a: usize, b: usize) -> bool {
        self.devices.get(a).map(|d| d.peer_enabled.get(b) == Some(&true)).unwrap_or(false)
    }

    /// Device component of the kernel fingerprint.
    pub fn device_key(&self, device: usize) -> String {
        match self.devices.get(device) {
            Some(d) => format!("sm_{}", d.compute_capability),
            None => String::new(),
        }
    }

    pub(crate) fn set_context(&self, context: CUcontext) {
        unsafe { (self.api.cuCtxSetCurrent.unwrap())(context) };
    }

    pub(crate) fn create_stream_event(
        &self,
        device: usize,
    ) -> Result<(CUstream, CUevent), BackendError> {
        self.set_context(self.devices[device].context);
        let mut stream: CUstream = ptr::null_mut();
        unsafe { (self.api.cuStreamCreate.unwrap())(&mut stream, CU_STREAM_NON_BLOCKING) }
            .check(ErrorStatus::Initialization, "cuStreamCreate failed")?;
        let mut event: CUevent = ptr::null_mut();
        unsafe { (self.api.cuEventCreate.unwrap())(&mut event, CU_EVENT_DISABLE_TIMING) }
            .check(ErrorStatus::Initialization, "cuEventCreate failed")?;
        Ok((stream, event))
    }

    /// Synchronize and tear down a thread's stream/event pair.
    pub(crate) fn destroy_stream_event(&self, device: usize, stream: CUstream, event: CUevent) {
        self.set_context(self.devices[device].context);
        unsafe {
            (self.api.cuStreamSynchronize.unwrap())(stream);
            (self.api.cuEventDestroy.unwrap())(event);
            (self.api.cuStreamDestroy.unwrap())(stream);
        }
    }

    pub(crate) fn sync_stream(&self, device: usize, stream: CUstream) -> Result<(), BackendError> {
        self.set_context(self.devices[device].context);
        unsafe { (self.api.cuStreamSynchronize.unwrap())(stream) }
            .check(ErrorStatus::Sync, "cuStreamSynchronize failed")
    }

    pub(crate) fn sync_context(&self, device: usize) -> Result<(), BackendError> {
        self.set_context(self.devices[device].context);
        unsafe { (self.api.cuCtxSynchronize.unwrap())() }
            .check(ErrorStatus::Sync, "cuCtxSynchronize failed")
    }

    pub fn alloc(&self, bytes: usize, device: usize) -> Result<Data, BackendError> {
        self.set_context(self.devices[device].context);
        let mut dptr: CUdeviceptr = 0;
        unsafe { (self.api.cuMemAlloc.unwrap())(&mut dptr, bytes.max(1)) }
            .check(ErrorStatus::MemoryAllocation, "cuMemAlloc failed")?;
        Ok(Data::Cuda { dptr, bytes, device })
    }

    pub fn free(&self, dptr: CUdeviceptr, _bytes: usize, device: usize) {
        self.set_context(self.devices[device].context);
        unsafe { (self.api.cuMemFree.unwrap())(dptr) };
    }

    pub fn memcpy_htod(&self, dst: CUdeviceptr, src: &[u8]) -> Result<(), BackendError> {
        unsafe { (self.api.cuMemcpyHtoD.unwrap())(dst, src.as_ptr().cast(), src.len()) }
            .check(ErrorStatus::MemoryCopy, "cuMemcpyHtoD failed")
    }

    pub fn memcpy_dtoh(&self, src: CUdeviceptr, dst: &mut [u8]) -> Result<(), BackendError> {
        unsafe { (self.api.cuMemcpyDtoH.unwrap())(dst.as_mut_ptr().cast(), src, dst.len()) }
            .check(ErrorStatus::MemoryCopy, "cuMemcpyDtoH failed")
    }

    /// Load PTX into a module on `device` and resolve the entry point.
    pub fn compile(
        &self,
        source: &str,
        entry: &str,
        device: usize,
    ) -> Result<Program, BackendError> {
        self.set_context(self.devices[device].context);
        let source = CString::new(source)
            .map_err(|_| BackendError::new(ErrorStatus::KernelCompilation, "NUL in source"))?;
        let mut module: CUmodule = ptr::null_mut();
        unsafe {
            (self.api.cuModuleLoadDataEx.unwrap())(
                &mut module,
                source.as_ptr().cast(),
                0,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        }
        .check(ErrorStatus::KernelCompilation, "cuModuleLoadDataEx failed")?;

        let entry_c = CString::new(entry).unwrap();
        let mut function: CUfunction = ptr::null_mut();
        unsafe { (self.api.cuModuleGetFunction.unwrap())(&mut function, module, entry_c.as_ptr()) }
            .check(ErrorStatus::KernelCompilation, "cuModuleGetFunction failed")?;

        Ok(Program::Cuda { module: module.cast(), function: function.cast() })
    }

    pub fn release_program(&self, program: &Program) {
        if let Program::Cuda { module, .. } = program {
            unsafe { (self.api.cuModuleUnload.unwrap())((*module).cast()) };
        }
    }

    /// Enqueue on the calling thread's stream and record its event. Grid
    /// configuration follows the output size; one element per thread.
    pub fn launch(
        &self,
        kernel: &Kernel,
        ts: &mut ThreadState,
        params: &[LaunchParam],
        size: u32,
    ) -> Result<(), BackendError> {
        let Program::Cuda { function, .. } = &kernel.program else {
            return Err(BackendError::new(ErrorStatus::KernelLaunch, "program backend mismatch"));
        };
        self.set_context(ts.context.cast());

        // Narrow blocks for launches too small to occupy every SM
        let num_sm = self.devices[ts.device].num_sm;
        let block_dim = if size < num_sm * 128 { 64u32 } else { 128u32 };
        let grid_dim = size.div_ceil(block_dim);

        // cuLaunchKernel reads argument values through an array of pointers
        let mut size_arg = size;
        let mut ptr_args: Vec<u64> = params.iter().map(|p| p.ptr).collect();
        let mut kernel_params: Vec<*mut c_void> = Vec::with_capacity(params.len() + 1);
        kernel_params.push((&mut size_arg as *mut u32).cast());
        for arg in &mut ptr_args {
            kernel_params.push((arg as *mut u64).cast());
        }

        unsafe {
            (self.api.cuLaunchKernel.unwrap())(
                (*function).cast(),
                grid_dim,
                1,
                1,
                block_dim,
                1,
                1,
                0,
                ts.stream.cast(),
                kernel_params.as_mut_ptr(),
                ptr::null_mut(),
            )
        }
        .check(ErrorStatus::KernelLaunch, "cuLaunchKernel failed")?;
        unsafe { (self.api.cuEventRecord.unwrap())(ts.event.cast(), ts.stream.cast()) }
            .check(ErrorStatus::KernelLaunch, "cuEventRecord failed")?;
        Ok(())
    }

    /// Tear down the device registry: sub-streams, events, primary contexts.
    pub fn shutdown(&mut self) {
        let api = &self.api;
        for device in self.devices.drain(..) {
            unsafe {
                (api.cuCtxSetCurrent.unwrap())(device.context);
                for event in device.sub_events {
                    (api.cuEventDestroy.unwrap())(event);
                }
                for stream in device.sub_streams {
                    (api.cuStreamDestroy.unwrap())(stream);
                }
                (api.cuDevicePrimaryCtxRelease.unwrap())(device.id);
            }
        }
        jit_log!(Info, "cuda", "backend shut down");
    }
}

/// PTX register prefix per slot type.
fn reg(vt: crate::dtype::VarType, slot: Slot) -> String {
    let prefix = match vt.byte_size() {
        1 => {
            if vt == crate::dtype::VarType::Bool {
                "%p"
            } else {
                "%b"
            }
        }
        2 => "%w",
        4 => {
            if vt.is_float() {
                "%f"
            } else {
                "%r"
            }
        }
        _ => {
            if vt.is_float() {
                "%d"
            } else {
                "%rd"
            }
        }
    };
    format!("{prefix}{slot}")
}

/// Emit PTX for a scheduled kernel. The text depends only on the kernel's
/// structure, never on ids or addresses, so identical scheduled kernels
/// render byte-identically.
pub(crate) fn emit_ptx(kernel: &ScheduledKernel, entry: &str, out: &mut String) {
    use std::fmt::Write;

    let _ = write!(
        out,
        ".version 6.3\n.target sm_50\n.address_size 64\n\n.visible .entry {entry}(.param .u32 size"
    );
    for (i, _) in kernel.params.iter().enumerate() {
        let _ = write!(out, ", .param .u64 arg{i}");
    }
    let _ = write!(
        out,
        ") {{\n    .reg.b32 %r<{n}>;\n    .reg.b64 %rd<{n}>;\n    .reg.f32 %f<{n}>;\n    \
         .reg.f64 %d<{n}>;\n    .reg.b16 %w<{n}>;\n    .reg.b8 %b<{n}>;\n    .reg.pred %p<{n}>;\n    \
         .reg.b32 %r_idx, %r_tid, %r_ntid, %r_size;\n    .reg.b64 %rd_p<{n}>;\n    \
         .reg.pred %p_oob;\n\n",
        n = kernel.ops.len().max(1) * 2 + 4
    );
    out.push_str(
        "    mov.u32 %r_idx, %ctaid.x;\n    mov.u32 %r_tid, %tid.x;\n    mov.u32 %r_ntid, \
         %ntid.x;\n    mad.lo.u32 %r_idx, %r_idx, %r_ntid, %r_tid;\n    ld.param.u32 %r_size, \
         [size];\n    setp.ge.u32 %p_oob, %r_idx, %r_size;\n    @%p_oob bra DONE;\n\n",
    );

    for (i, op) in kernel.ops.iter().enumerate() {
        let slot = i as Slot;
        match op {
            KernelOp::Const { vt, bits } => {
                let _ = writeln!(
                    out,
                    "    mov.{} {}, {};",
                    vt.ptx(),
                    reg(*vt, slot),
                    crate::dtype::literal_to_string(*bits, *vt)
                );
            }
            KernelOp::Index => {
                let _ = writeln!(out, "    mov.u32 {}, %r_idx;", reg(crate::dtype::VarType::U32, slot));
            }
            KernelOp::Load { param, vt, broadcast } => {
                let _ = writeln!(out, "    ld.param.u64 %rd_p{slot}, [arg{param}];");
                if *broadcast {
                    let _ = writeln!(
                        out,
                        "    ld.global.{} {}, [%rd_p{slot}];",
                        vt.ptx_bin(),
                        reg(*vt, slot)
                    );
                } else {
                    let _ = writeln!(
                        out,
                        "    mad.wide.u32 %rd_p{slot}, %r_idx, {}, %rd_p{slot};",
                        vt.byte_size()
                    );
                    let _ = writeln!(
                        out,
                        "    ld.global.{} {}, [%rd_p{slot}];",
                        vt.ptx_bin(),
                        reg(*vt, slot)
                    );
                }
            }
            KernelOp::Unary { op, vt, x } => {
                let instr = match op {
                    Op::Neg => "neg",
                    Op::Not => "not",
                    Op::Sqrt => "sqrt.rn",
                    Op::Abs => "abs",
                    Op::Ceil => "cvt.rpi",
                    Op::Floor => "cvt.rmi",
                    Op::Round => "cvt.rni",
                    Op::Trunc => "cvt.rzi",
                    Op::Popc => "popc",
                    Op::Clz => "clz",
                    Op::Ctz => "brev+clz",
                    Op::Rcp => "rcp.approx",
                    Op::Rsqrt => "rsqrt.approx",
                    Op::Sin => "sin.approx",
                    Op::Cos => "cos.approx",
                    Op::Exp2 => "ex2.approx",
                    Op::Log2 => "lg2.approx",
                    Op::Cast => "cvt",
                    Op::Bitcast => "mov",
                    _ => "???",
                };
                let _ = writeln!(
                    out,
                    "    {instr}.{} {}, {};",
                    vt.ptx(),
                    reg(*vt, slot),
                    reg(*vt, *x)
                );
            }
            KernelOp::Binary { op, vt, x, y } => {
                let instr = match op {
                    Op::Add => "add",
                    Op::Sub => "sub",
                    Op::Mul => {
                        if vt.is_float() {
                            "mul"
                        } else {
                            "mul.lo"
                        }
                    }
                    Op::Div => {
                        if vt.is_float() {
                            "div.rn"
                        } else {
                            "div"
                        }
                    }
                    Op::Mod => "rem",
                    Op::Mulhi => "mul.hi",
                    Op::Min => "min",
                    Op::Max => "max",
                    Op::Eq => "setp.eq",
                    Op::Neq => "setp.ne",
                    Op::Lt => "setp.lt",
                    Op::Le => "setp.le",
                    Op::Gt => "setp.gt",
                    Op::Ge => "setp.ge",
                    Op::And => "and",
                    Op::Or => "or",
                    Op::Xor => "xor",
                    Op::Shl => "shl",
                    Op::Shr => "shr",
                    _ => "???",
                };
                // Comparisons write a predicate register
                let dst = if op.is_comparison() {
                    format!("%p{slot}")
                } else {
                    reg(*vt, slot)
                };
                let _ = writeln!(
                    out,
                    "    {instr}.{} {dst}, {}, {};",
                    vt.ptx(),
                    reg(*vt, *x),
                    reg(*vt, *y)
                );
            }
            KernelOp::Ternary { op, vt, x, y, z } => match op {
                Op::Fma => {
                    let _ = writeln!(
                        out,
                        "    fma.rn.{} {}, {}, {}, {};",
                        vt.ptx(),
                        reg(*vt, slot),
                        reg(*vt, *x),
                        reg(*vt, *y),
                        reg(*vt, *z)
                    );
                }
                Op::Select => {
                    let _ = writeln!(
                        out,
                        "    selp.{} {}, {}, {}, %p{x};",
                        vt.ptx_bin(),
                        reg(*vt, slot),
                        reg(*vt, *y),
                        reg(*vt, *z)
                    );
                }
                _ => {}
            },
            KernelOp::Gather { param, vt, index, mask } => {
                let _ = writeln!(out, "    ld.param.u64 %rd_p{slot}, [arg{param}];");
                let _ = writeln!(
                    out,
                    "    mad.wide.u32 %rd_p{slot}, {}, {}, %rd_p{slot};",
                    reg(crate::dtype::VarType::U32, *index),
                    vt.byte_size()
                );
                if *mask != UNMASKED {
                    let _ = writeln!(out, "    @!%p{mask} bra SKIP{slot};");
                }
                let _ = writeln!(
                    out,
                    "    ld.global.{} {}, [%rd_p{slot}];",
                    vt.ptx_bin(),
                    reg(*vt, slot)
                );
                if *mask != UNMASKED {
                    let _ = writeln!(out, "SKIP{slot}:");
                }
            }
            KernelOp::Scatter { param, vt, index, value, mask } => {
                let _ = writeln!(out, "    ld.param.u64 %rd_p{slot}, [arg{param}];");
                let _ = writeln!(
                    out,
                    "    mad.wide.u32 %rd_p{slot}, {}, {}, %rd_p{slot};",
                    reg(crate::dtype::VarType::U32, *index),
                    vt.byte_size()
                );
                if *mask != UNMASKED {
                    let _ = writeln!(out, "    @!%p{mask} bra SKIP{slot};");
                }
                let _ = writeln!(
                    out,
                    "    st.global.{} [%rd_p{slot}], {};",
                    vt.ptx_bin(),
                    reg(*vt, *value)
                );
                if *mask != UNMASKED {
                    let _ = writeln!(out, "SKIP{slot}:");
                }
            }
            KernelOp::Store { param, vt, x } => {
                let _ = writeln!(out, "    ld.param.u64 %rd_p{slot}, [arg{param}];");
                let _ = writeln!(
                    out,
                    "    mad.wide.u32 %rd_p{slot}, %r_idx, {}, %rd_p{slot};",
                    vt.byte_size()
                );
                let _ = writeln!(
                    out,
                    "    st.global.{} [%rd_p{slot}], {};",
                    vt.ptx_bin(),
                    reg(*vt, *x)
                );
            }
        }
    }
    out.push_str("\nDONE:\n    ret;\n}\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::VarType;

    fn sample_kernel() -> ScheduledKernel {
        use crate::kernel::ParamKind;
        ScheduledKernel {
            backend: crate::backend::JitBackend::Cuda,
            size: 1000,
            ops: vec![
                KernelOp::Index,
                KernelOp::Load { param: 0, vt: VarType::F32, broadcast: false },
                KernelOp::Const { vt: VarType::F32, bits: u64::from(2.0f32.to_bits()) },
                KernelOp::Binary { op: Op::Mul, vt: VarType::F32, x: 1, y: 2 },
                KernelOp::Store { param: 1, vt: VarType::F32, x: 3 },
            ],
            params: vec![(1, ParamKind::Input), (2, ParamKind::Output)],
        }
    }

    #[test]
    fn ptx_emission_is_deterministic() {
        let kernel = sample_kernel();
        let mut a = String::new();
        let mut b = String::new();
        emit_ptx(&kernel, "enoki_kernel", &mut a);
        emit_ptx(&kernel, "enoki_kernel", &mut b);
        assert_eq!(a, b);
        assert!(a.starts_with(".version"));
        assert!(a.contains(".visible .entry enoki_kernel"));
        assert!(a.contains("mul.f32"));
        assert!(a.contains("st.global.b32"));
    }
}
