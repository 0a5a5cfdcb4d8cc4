//! CPU backend driving an LLVM shared library through its C API.
//!
//! Like the CUDA side, every entry point is an optional function pointer
//! resolved in one pass. LLVM's C surface has shifted across major
//! versions, so the probes are grouped: a library missing the core group,
//! or missing both pass-builder generations, shuts the backend down
//! cleanly instead of crashing on first use.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr;
use std::sync::Arc;

use libloading::Library;

use super::loader::find_library;
use super::pool::{block_range, CpuPool};
use super::LaunchParam;
use crate::error::{BackendError, ErrorStatus};
use crate::kernel::{Kernel, KernelOp, Program, ScheduledKernel, Slot, UNMASKED};
use crate::log::jit_log;
use crate::op::Op;
use crate::thread_state::ThreadState;

type LLVMBool = c_int;
type LLVMMemoryBufferRef = *mut c_void;
type LLVMContextRef = *mut c_void;
type LLVMModuleRef = *mut c_void;
type LLVMExecutionEngineRef = *mut c_void;
type LLVMPassBuilderOptionsRef = *mut c_void;
type LLVMPassManagerRef = *mut c_void;
type LLVMTargetMachineRef = *mut c_void;
type LLVMErrorRef = *mut c_void;

/// Typed function pointers into the LLVM library, resolved once.
#[allow(non_snake_case)]
#[derive(Default)]
pub(crate) struct LlvmApi {
    // Core group
    LLVMGetDefaultTargetTriple: Option<unsafe extern "C" fn() -> *mut c_char>,
    LLVMGetHostCPUName: Option<unsafe extern "C" fn() -> *mut c_char>,
    LLVMGetHostCPUFeatures: Option<unsafe extern "C" fn() -> *mut c_char>,
    LLVMDisposeMessage: Option<unsafe extern "C" fn(*mut c_char)>,
    LLVMContextCreate: Option<unsafe extern "C" fn() -> LLVMContextRef>,
    LLVMContextDispose: Option<unsafe extern "C" fn(LLVMContextRef)>,
    LLVMCreateMemoryBufferWithMemoryRangeCopy: Option<
        unsafe extern "C" fn(*const c_char, usize, *const c_char) -> LLVMMemoryBufferRef,
    >,
    LLVMParseIRInContext: Option<
        unsafe extern "C" fn(
            LLVMContextRef,
            LLVMMemoryBufferRef,
            *mut LLVMModuleRef,
            *mut *mut c_char,
        ) -> LLVMBool,
    >,
    LLVMVerifyModule:
        Option<unsafe extern "C" fn(LLVMModuleRef, c_int, *mut *mut c_char) -> LLVMBool>,
    LLVMDisposeModule: Option<unsafe extern "C" fn(LLVMModuleRef)>,
    LLVMLinkInMCJIT: Option<unsafe extern "C" fn()>,
    LLVMInitializeNativeTarget: Option<unsafe extern "C" fn() -> LLVMBool>,
    LLVMInitializeNativeAsmPrinter: Option<unsafe extern "C" fn() -> LLVMBool>,

    // MCJIT group
    LLVMCreateExecutionEngineForModule: Option<
        unsafe extern "C" fn(
            *mut LLVMExecutionEngineRef,
            LLVMModuleRef,
            *mut *mut c_char,
        ) -> LLVMBool,
    >,
    LLVMGetFunctionAddress:
        Option<unsafe extern "C" fn(LLVMExecutionEngineRef, *const c_char) -> u64>,
    LLVMDisposeExecutionEngine: Option<unsafe extern "C" fn(LLVMExecutionEngineRef)>,

    // ORCv2 group (probed, preferred when complete)
    LLVMOrcCreateNewThreadSafeContext: Option<unsafe extern "C" fn() -> *mut c_void>,
    LLVMOrcLLJITBuilderCreate: Option<unsafe extern "C" fn() -> *mut c_void>,
    LLVMOrcCreateLLJIT:
        Option<unsafe extern "C" fn(*mut *mut c_void, *mut c_void) -> LLVMErrorRef>,

    // New pass manager group
    LLVMCreatePassBuilderOptions: Option<unsafe extern "C" fn() -> LLVMPassBuilderOptionsRef>,
    LLVMDisposePassBuilderOptions: Option<unsafe extern "C" fn(LLVMPassBuilderOptionsRef)>,
    LLVMRunPasses: Option<
        unsafe extern "C" fn(
            LLVMModuleRef,
            *const c_char,
            LLVMTargetMachineRef,
            LLVMPassBuilderOptionsRef,
        ) -> LLVMErrorRef,
    >,

    // Legacy pass manager group
    LLVMCreatePassManager: Option<unsafe extern "C" fn() -> LLVMPassManagerRef>,
    LLVMRunPassManager: Option<unsafe extern "C" fn(LLVMPassManagerRef, LLVMModuleRef) -> LLVMBool>,
    LLVMDisposePassManager: Option<unsafe extern "C" fn(LLVMPassManagerRef)>,
}

macro_rules! resolve {
    ($lib:expr, $name:literal) => {
        unsafe { $lib.get(concat!($name, "\0").as_bytes()).ok().map(|sym| *sym) }
    };
}

impl LlvmApi {
    fn resolve(lib: &Library) -> LlvmApi {
        LlvmApi {
            LLVMGetDefaultTargetTriple: resolve!(lib, "LLVMGetDefaultTargetTriple"),
            LLVMGetHostCPUName: resolve!(lib, "LLVMGetHostCPUName"),
            LLVMGetHostCPUFeatures: resolve!(lib, "LLVMGetHostCPUFeatures"),
            LLVMDisposeMessage: resolve!(lib, "LLVMDisposeMessage"),
            LLVMContextCreate: resolve!(lib, "LLVMContextCreate"),
            LLVMContextDispose: resolve!(lib, "LLVMContextDispose"),
            LLVMCreateMemoryBufferWithMemoryRangeCopy: resolve!(
                lib,
                "LLVMCreateMemoryBufferWithMemoryRangeCopy"
            ),
            LLVMParseIRInContext: resolve!(lib, "LLVMParseIRInContext"),
            LLVMVerifyModule: resolve!(lib, "LLVMVerifyModule"),
            LLVMDisposeModule: resolve!(lib, "LLVMDisposeModule"),
            LLVMLinkInMCJIT: resolve!(lib, "LLVMLinkInMCJIT"),
            LLVMInitializeNativeTarget: resolve!(lib, "LLVMInitializeNativeTarget"),
            LLVMInitializeNativeAsmPrinter: resolve!(lib, "LLVMInitializeNativeAsmPrinter"),
            LLVMCreateExecutionEngineForModule: resolve!(lib, "LLVMCreateExecutionEngineForModule"),
            LLVMGetFunctionAddress: resolve!(lib, "LLVMGetFunctionAddress"),
            LLVMDisposeExecutionEngine: resolve!(lib, "LLVMDisposeExecutionEngine"),
            LLVMOrcCreateNewThreadSafeContext: resolve!(lib, "LLVMOrcCreateNewThreadSafeContext"),
            LLVMOrcLLJITBuilderCreate: resolve!(lib, "LLVMOrcLLJITBuilderCreate"),
            LLVMOrcCreateLLJIT: resolve!(lib, "LLVMOrcCreateLLJIT"),
            LLVMCreatePassBuilderOptions: resolve!(lib, "LLVMCreatePassBuilderOptions"),
            LLVMDisposePassBuilderOptions: resolve!(lib, "LLVMDisposePassBuilderOptions"),
            LLVMRunPasses: resolve!(lib, "LLVMRunPasses"),
            LLVMCreatePassManager: resolve!(lib, "LLVMCreatePassManager"),
            LLVMRunPassManager: resolve!(lib, "LLVMRunPassManager"),
            LLVMDisposePassManager: resolve!(lib, "LLVMDisposePassManager"),
        }
    }

    pub(crate) fn has_core(&self) -> bool {
        self.LLVMGetDefaultTargetTriple.is_some()
            && self.LLVMGetHostCPUName.is_some()
            && self.LLVMGetHostCPUFeatures.is_some()
            && self.LLVMDisposeMessage.is_some()
            && self.LLVMContextCreate.is_some()
            && self.LLVMContextDispose.is_some()
            && self.LLVMCreateMemoryBufferWithMemoryRangeCopy.is_some()
            && self.LLVMParseIRInContext.is_some()
            && self.LLVMVerifyModule.is_some()
            && self.LLVMDisposeModule.is_some()
    }

    pub(crate) fn has_mcjit(&self) -> bool {
        self.LLVMLinkInMCJIT.is_some()
            && self.LLVMCreateExecutionEngineForModule.is_some()
            && self.LLVMGetFunctionAddress.is_some()
            && self.LLVMDisposeExecutionEngine.is_some()
    }

    pub(crate) fn has_orcv2(&self) -> bool {
        self.LLVMOrcCreateNewThreadSafeContext.is_some()
            && self.LLVMOrcLLJITBuilderCreate.is_some()
            && self.LLVMOrcCreateLLJIT.is_some()
    }

    pub(crate) fn has_pass_builder_new(&self) -> bool {
        self.LLVMCreatePassBuilderOptions.is_some()
            && self.LLVMDisposePassBuilderOptions.is_some()
            && self.LLVMRunPasses.is_some()
    }

    pub(crate) fn has_pass_builder_legacy(&self) -> bool {
        self.LLVMCreatePassManager.is_some()
            && self.LLVMRunPassManager.is_some()
            && self.LLVMDisposePassManager.is_some()
    }
}

/// Executable host memory holding compiled kernel code.
pub struct ExecMem {
    ptr: *mut c_void,
    size: usize,
}

unsafe impl Send for ExecMem {}
unsafe impl Sync for ExecMem {}

impl ExecMem {
    /// Copy machine code into a fresh mapping and flip it to read+execute.
    #[cfg(unix)]
    pub fn new(code: &[u8]) -> Result<ExecMem, BackendError> {
        let size = code.len().max(1);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(BackendError::new(ErrorStatus::MemoryAllocation, "mmap failed"));
        }
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), ptr.cast(), code.len());
            if libc::mprotect(ptr, size, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                libc::munmap(ptr, size);
                return Err(BackendError::new(ErrorStatus::MemoryAllocation, "mprotect failed"));
            }
        }
        Ok(ExecMem { ptr, size })
    }

    #[cfg(not(unix))]
    pub fn new(_code: &[u8]) -> Result<ExecMem, BackendError> {
        Err(BackendError::new(ErrorStatus::KernelCompilation, "unsupported platform"))
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.cast()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.cast(), self.size) }
    }
}

impl Drop for ExecMem {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr, self.size);
        }
    }
}

pub struct LlvmBackend {
    #[allow(unused)]
    lib: Arc<Library>,
    api: LlvmApi,
    context: LLVMContextRef,
    pub target_triple: String,
    pub target_cpu: String,
    pub target_features: String,
    pub vector_width: u32,
    pub use_orcv2: bool,
}

unsafe impl Send for LlvmBackend {}
unsafe impl Sync for LlvmBackend {}

impl LlvmBackend {
    pub fn init() -> Option<LlvmBackend> {
        let lib = find_library(
            "libLLVM",
            &["/usr/lib/x86_64-linux-gnu", "/usr/lib64", "/usr/lib", "/usr/lib/llvm"],
            "ENOKI_LIBLLVM_PATH",
        )?;
        let api = LlvmApi::resolve(&lib);
        if !api.has_core() {
            jit_log!(
                Warn,
                "llvm",
                "detected LLVM version lacks the core API used by the JIT, shutting down backend"
            );
            return None;
        }
        if !api.has_pass_builder_new() && !api.has_pass_builder_legacy() {
            jit_log!(
                Warn,
                "llvm",
                "detected LLVM version lacks both pass manager generations, shutting down backend"
            );
            return None;
        }
        if !api.has_orcv2() && !api.has_mcjit() {
            jit_log!(Warn, "llvm", "neither ORCv2 nor MCJIT available, shutting down backend");
            return None;
        }

        unsafe {
            if let Some(f) = api.LLVMInitializeNativeTarget {
                f();
            }
            if let Some(f) = api.LLVMInitializeNativeAsmPrinter {
                f();
            }
            if let Some(f) = api.LLVMLinkInMCJIT {
                f();
            }
        }

        let take_message = |ptr: *mut c_char| -> String {
            if ptr.is_null() {
                return String::new();
            }
            let s = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
            unsafe { (api.LLVMDisposeMessage.unwrap())(ptr) };
            s
        };

        let target_triple = take_message(unsafe { (api.LLVMGetDefaultTargetTriple.unwrap())() });
        let target_cpu = take_message(unsafe { (api.LLVMGetHostCPUName.unwrap())() });
        let target_features = take_message(unsafe { (api.LLVMGetHostCPUFeatures.unwrap())() });

        let mut vector_width = 1;
        if target_features.contains("+sse4.2") {
            vector_width = 4;
        }
        if target_features.contains("+avx") {
            vector_width = 8;
        }
        if target_features.contains("+avx512vl") {
            vector_width = 16;
        }
        if cfg!(target_arch = "aarch64") {
            vector_width = vector_width.max(4);
        }
        if vector_width == 1 {
            jit_log!(Warn, "llvm", "no suitable vector ISA found, shutting down backend");
            return None;
        }

        let context = unsafe { (api.LLVMContextCreate.unwrap())() };
        let use_orcv2 = api.has_orcv2();
        jit_log!(
            Info,
            "llvm",
            "found LLVM ({}), target={target_triple}, cpu={target_cpu}, width={vector_width}",
            if use_orcv2 { "ORCv2" } else { "MCJIT" }
        );

        Some(LlvmBackend {
            lib: Arc::new(lib),
            api,
            context,
            target_triple,
            target_cpu,
            target_features,
            vector_width,
            use_orcv2,
        })
    }

    /// Device component of the kernel fingerprint: target triple, CPU
    /// name, feature string, and vector width all change generated code.
    pub fn device_key(&self) -> String {
        format!(
            "{};{};{};w{}",
            self.target_triple, self.target_cpu, self.target_features, self.vector_width
        )
    }

    /// Parse, verify, optimize and JIT the IR; copy the machine code into
    /// executable memory the core owns.
    pub fn compile(&self, source: &str, entry: &str) -> Result<Program, BackendError> {
        jit_log!(
            Trace,
            "llvm",
            "compiling {} bytes of IR via {}",
            source.len(),
            if self.use_orcv2 && self.api.has_mcjit() { "MCJIT (ORCv2 available)" } else { "MCJIT" }
        );
        let api = &self.api;
        let name = CString::new("enoki_kernel").unwrap();
        let buf = unsafe {
            (api.LLVMCreateMemoryBufferWithMemoryRangeCopy.unwrap())(
                source.as_ptr().cast(),
                source.len(),
                name.as_ptr(),
            )
        };
        if buf.is_null() {
            return Err(BackendError::new(
                ErrorStatus::KernelCompilation,
                "could not create memory buffer",
            ));
        }

        let mut module: LLVMModuleRef = ptr::null_mut();
        let mut error: *mut c_char = ptr::null_mut();
        let rv = unsafe {
            (api.LLVMParseIRInContext.unwrap())(self.context, buf, &mut module, &mut error)
        };
        if rv != 0 {
            let msg = self.take_error(error);
            return Err(BackendError::new(
                ErrorStatus::KernelCompilation,
                format!("IR parsing failed: {msg}"),
            ));
        }

        // LLVMReturnStatusAction == 2
        let mut error: *mut c_char = ptr::null_mut();
        let broken = unsafe { (api.LLVMVerifyModule.unwrap())(module, 2, &mut error) };
        if broken != 0 {
            let msg = self.take_error(error);
            unsafe { (api.LLVMDisposeModule.unwrap())(module) };
            return Err(BackendError::new(
                ErrorStatus::KernelCompilation,
                format!("module verification failed: {msg}"),
            ));
        }

        if self.api.has_pass_builder_new() {
            let opts = unsafe { (api.LLVMCreatePassBuilderOptions.unwrap())() };
            let pipeline = CString::new("default<O2>").unwrap();
            let err =
                unsafe { (api.LLVMRunPasses.unwrap())(module, pipeline.as_ptr(), ptr::null_mut(), opts) };
            unsafe { (api.LLVMDisposePassBuilderOptions.unwrap())(opts) };
            if !err.is_null() {
                jit_log!(Warn, "llvm", "optimization pipeline reported an error, continuing");
            }
        } else {
            let pm = unsafe { (api.LLVMCreatePassManager.unwrap())() };
            unsafe {
                (api.LLVMRunPassManager.unwrap())(pm, module);
                (api.LLVMDisposePassManager.unwrap())(pm);
            }
        }

        // MCJIT path: materialize the function and copy it out. The engine
        // owns `module` from here on.
        if !self.api.has_mcjit() {
            unsafe { (api.LLVMDisposeModule.unwrap())(module) };
            return Err(BackendError::new(
                ErrorStatus::KernelCompilation,
                "ORCv2-only compilation path is not wired up for this library version",
            ));
        }

        let mut engine: LLVMExecutionEngineRef = ptr::null_mut();
        let mut error: *mut c_char = ptr::null_mut();
        let rv = unsafe {
            (api.LLVMCreateExecutionEngineForModule.unwrap())(&mut engine, module, &mut error)
        };
        if rv != 0 {
            let msg = self.take_error(error);
            return Err(BackendError::new(
                ErrorStatus::KernelCompilation,
                format!("execution engine creation failed: {msg}"),
            ));
        }

        let entry_c = CString::new(entry).unwrap();
        let addr = unsafe { (api.LLVMGetFunctionAddress.unwrap())(engine, entry_c.as_ptr()) };
        if addr == 0 {
            unsafe { (api.LLVMDisposeExecutionEngine.unwrap())(engine) };
            return Err(BackendError::new(
                ErrorStatus::KernelCompilation,
                "entry point not found after compilation",
            ));
        }

        // Conservative copy window; the kernel body is tiny compared to it
        const KERNEL_COPY_BYTES: usize = 1 << 16;
        let code = unsafe { std::slice::from_raw_parts(addr as *const u8, KERNEL_COPY_BYTES) };
        let mem = ExecMem::new(code)?;
        unsafe { (api.LLVMDisposeExecutionEngine.unwrap())(engine) };

        Ok(Program::Cpu { code: mem, entry: 0, reloc: vec![0] })
    }

    /// Rebuild a program from persisted machine code.
    pub fn load_artifact(&self, artifact: &[u8]) -> Result<Program, BackendError> {
        if artifact.len() < 8 {
            return Err(BackendError::new(ErrorStatus::KernelCompilation, "truncated artifact"));
        }
        let entry = u64::from_le_bytes(artifact[..8].try_into().unwrap()) as usize;
        let mem = ExecMem::new(&artifact[8..])?;
        Ok(Program::Cpu { code: mem, entry, reloc: vec![entry] })
    }

    /// Serialize a compiled program for the on-disk store.
    pub fn artifact_bytes(program: &Program) -> Vec<u8> {
        let Program::Cpu { code, entry, .. } = program else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(8 + code.len());
        out.extend_from_slice(&(*entry as u64).to_le_bytes());
        out.extend_from_slice(code.as_bytes());
        out
    }

    fn take_error(&self, error: *mut c_char) -> String {
        if error.is_null() {
            return "unknown error".into();
        }
        let msg = unsafe { CStr::from_ptr(error) }.to_string_lossy().into_owned();
        unsafe { (self.api.LLVMDisposeMessage.unwrap())(error) };
        msg
    }

    /// Submit the compiled kernel to the pool, one work item per block of
    /// `cpu_block_size` elements. The thread state keeps the task handle.
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
            let Program::Cpu { code, entry, .. } = &kernel.program else {
                return;
            };
            // fn(start, end, args) per the emitted kernel signature
            let func: unsafe extern "C" fn(u32, u32, *const u64) = unsafe {
                std::mem::transmute::<*const u8, unsafe extern "C" fn(u32, u32, *const u64)>(
                    code.as_ptr().add(*entry),
                )
            };
            let args: Vec<u64> = params.iter().map(|p| p.ptr).collect();
            let blocks: Vec<(u32, u32)> = block_range(size, cpu_block_size).collect();
            workers.scope(|scope| {
                for (start, end) in blocks {
                    let args = &args;
                    scope.spawn(move |_| unsafe { func(start, end, args.as_ptr()) });
                }
            });
        });
        ts.task = Some(task);
        Ok(())
    }

    pub fn shutdown(&mut self) {
        unsafe {
            if let Some(dispose) = self.api.LLVMContextDispose {
                if !self.context.is_null() {
                    dispose(self.context);
                }
            }
        }
        self.context = ptr::null_mut();
        jit_log!(Info, "llvm", "backend shut down");
    }
}

/// Emit a scalar-loop LLVM IR kernel. Registers are named after their
/// slot, buffer arguments load from an argument array, and the function
/// processes the half-open range [start, end).
pub(crate) fn emit_ir(kernel: &ScheduledKernel, entry: &str, out: &mut String) {
    use std::fmt::Write;

    let _ = writeln!(
        out,
        "define void @{entry}(i32 %start, i32 %end, ptr %args) #0 {{\nentry:\n  br label %loop\n"
    );
    out.push_str(
        "loop:\n  %index = phi i32 [ %start, %entry ], [ %index_next, %latch ]\n  %done = icmp \
         uge i32 %index, %end\n  br i1 %done, label %exit, label %body\n\nbody:\n",
    );

    let value = |slot: Slot| format!("%v{slot}");

    for (i, op) in kernel.ops.iter().enumerate() {
        let slot = i as Slot;
        match op {
            KernelOp::Const { vt, bits } => {
                let _ = writeln!(
                    out,
                    "  {} = bitcast {} {} to {}",
                    value(slot),
                    vt.llvm(),
                    crate::dtype::literal_to_string(*bits, *vt),
                    vt.llvm()
                );
            }
            KernelOp::Index => {
                let _ = writeln!(out, "  {} = add i32 %index, 0", value(slot));
            }
            KernelOp::Load { param, vt, broadcast } => {
                let _ = writeln!(out, "  %a{slot} = getelementptr ptr, ptr %args, i32 {param}");
                let _ = writeln!(out, "  %p{slot} = load ptr, ptr %a{slot}");
                if *broadcast {
                    let _ = writeln!(out, "  {} = load {}, ptr %p{slot}", value(slot), vt.llvm());
                } else {
                    let _ = writeln!(
                        out,
                        "  %q{slot} = getelementptr {}, ptr %p{slot}, i32 %index",
                        vt.llvm()
                    );
                    let _ = writeln!(out, "  {} = load {}, ptr %q{slot}", value(slot), vt.llvm());
                }
            }
            KernelOp::Unary { op, vt, x } => {
                let ty = vt.llvm();
                let x = value(*x);
                let v = value(slot);
                match op {
                    Op::Neg if vt.is_float() => {
                        let _ = writeln!(out, "  {v} = fneg {ty} {x}");
                    }
                    Op::Neg => {
                        let _ = writeln!(out, "  {v} = sub {ty} 0, {x}");
                    }
                    Op::Not => {
                        let _ = writeln!(out, "  {v} = xor {ty} {x}, -1");
                    }
                    Op::Rcp => {
                        let _ = writeln!(out, "  {v} = fdiv {ty} 1.0, {x}");
                    }
                    Op::Cast => {
                        let _ = writeln!(out, "  {v} = call {ty} @jit.cast.{ty}({x})");
                    }
                    Op::Bitcast => {
                        let _ = writeln!(out, "  {v} = bitcast {ty} {x} to {ty}");
                    }
                    op => {
                        let intrin = match op {
                            Op::Sqrt => "sqrt",
                            Op::Abs => {
                                if vt.is_float() {
                                    "fabs"
                                } else {
                                    "abs"
                                }
                            }
                            Op::Ceil => "ceil",
                            Op::Floor => "floor",
                            Op::Round => "roundeven",
                            Op::Trunc => "trunc",
                            Op::Popc => "ctpop",
                            Op::Clz => "ctlz",
                            Op::Ctz => "cttz",
                            Op::Rsqrt => "rsqrt",
                            Op::Sin => "sin",
                            Op::Cos => "cos",
                            Op::Exp2 => "exp2",
                            Op::Log2 => "log2",
                            _ => "nop",
                        };
                        let _ = writeln!(out, "  {v} = call {ty} @llvm.{intrin}.{ty}({ty} {x})");
                    }
                }
            }
            KernelOp::Binary { op, vt, x, y } if matches!(op, Op::Min | Op::Max | Op::Mulhi) => {
                let ty = vt.llvm();
                let intrin = match (op, vt.is_float(), vt.is_unsigned()) {
                    (Op::Min, true, _) => "minnum",
                    (Op::Min, false, true) => "umin",
                    (Op::Min, false, false) => "smin",
                    (Op::Max, true, _) => "maxnum",
                    (Op::Max, false, true) => "umax",
                    (Op::Max, false, false) => "smax",
                    (_, _, true) => "umul.hi",
                    (_, _, false) => "smul.hi",
                };
                let _ = writeln!(
                    out,
                    "  {} = call {ty} @llvm.{intrin}.{ty}({ty} {}, {ty} {})",
                    value(slot),
                    value(*x),
                    value(*y)
                );
            }
            KernelOp::Binary { op, vt, x, y } => {
                let instr = match (op, vt.is_float(), vt.is_unsigned()) {
                    (Op::Add, true, _) => "fadd",
                    (Op::Add, false, _) => "add",
                    (Op::Sub, true, _) => "fsub",
                    (Op::Sub, false, _) => "sub",
                    (Op::Mul, true, _) => "fmul",
                    (Op::Mul, false, _) => "mul",
                    (Op::Div, true, _) => "fdiv",
                    (Op::Div, false, true) => "udiv",
                    (Op::Div, false, false) => "sdiv",
                    (Op::Mod, true, _) => "frem",
                    (Op::Mod, false, true) => "urem",
                    (Op::Mod, false, false) => "srem",
                    (Op::Eq, true, _) => "fcmp oeq",
                    (Op::Eq, false, _) => "icmp eq",
                    (Op::Neq, true, _) => "fcmp one",
                    (Op::Neq, false, _) => "icmp ne",
                    (Op::Lt, true, _) => "fcmp olt",
                    (Op::Lt, false, true) => "icmp ult",
                    (Op::Lt, false, false) => "icmp slt",
                    (Op::Le, true, _) => "fcmp ole",
                    (Op::Le, false, true) => "icmp ule",
                    (Op::Le, false, false) => "icmp sle",
                    (Op::Gt, true, _) => "fcmp ogt",
                    (Op::Gt, false, true) => "icmp ugt",
                    (Op::Gt, false, false) => "icmp sgt",
                    (Op::Ge, true, _) => "fcmp oge",
                    (Op::Ge, false, true) => "icmp uge",
                    (Op::Ge, false, false) => "icmp sge",
                    (Op::And, _, _) => "and",
                    (Op::Or, _, _) => "or",
                    (Op::Xor, _, _) => "xor",
                    (Op::Shl, _, _) => "shl",
                    (Op::Shr, _, true) => "lshr",
                    (Op::Shr, _, false) => "ashr",
                    _ => "???",
                };
                let _ = writeln!(
                    out,
                    "  {} = {instr} {} {}, {}",
                    value(slot),
                    vt.llvm(),
                    value(*x),
                    value(*y)
                );
            }
            KernelOp::Ternary { op, vt, x, y, z } => match op {
                Op::Fma => {
                    let _ = writeln!(
                        out,
                        "  {} = call {} @llvm.fma({} {}, {} {}, {} {})",
                        value(slot),
                        vt.llvm(),
                        vt.llvm(),
                        value(*x),
                        vt.llvm(),
                        value(*y),
                        vt.llvm(),
                        value(*z)
                    );
                }
                Op::Select => {
                    let _ = writeln!(
                        out,
                        "  {} = select i1 {}, {} {}, {} {}",
                        value(slot),
                        value(*x),
                        vt.llvm(),
                        value(*y),
                        vt.llvm(),
                        value(*z)
                    );
                }
                _ => {}
            },
            KernelOp::Gather { param, vt, index, mask } => {
                let _ = writeln!(out, "  %a{slot} = getelementptr ptr, ptr %args, i32 {param}");
                let _ = writeln!(out, "  %p{slot} = load ptr, ptr %a{slot}");
                let _ = writeln!(
                    out,
                    "  %q{slot} = getelementptr {}, ptr %p{slot}, i32 {}",
                    vt.llvm(),
                    value(*index)
                );
                if *mask != UNMASKED {
                    let _ = writeln!(
                        out,
                        "  {} = call {} @llvm.masked.load(ptr %q{slot}, i1 {})",
                        value(slot),
                        vt.llvm(),
                        value(*mask)
                    );
                } else {
                    let _ = writeln!(out, "  {} = load {}, ptr %q{slot}", value(slot), vt.llvm());
                }
            }
            KernelOp::Scatter { param, vt, index, value: v, mask } => {
                let _ = writeln!(out, "  %a{slot} = getelementptr ptr, ptr %args, i32 {param}");
                let _ = writeln!(out, "  %p{slot} = load ptr, ptr %a{slot}");
                let _ = writeln!(
                    out,
                    "  %q{slot} = getelementptr {}, ptr %p{slot}, i32 {}",
                    vt.llvm(),
                    value(*index)
                );
                if *mask != UNMASKED {
                    let _ = writeln!(
                        out,
                        "  call void @llvm.masked.store({} {}, ptr %q{slot}, i1 {})",
                        vt.llvm(),
                        value(*v),
                        value(*mask)
                    );
                } else {
                    let _ = writeln!(out, "  store {} {}, ptr %q{slot}", vt.llvm(), value(*v));
                }
            }
            KernelOp::Store { param, vt, x } => {
                let _ = writeln!(out, "  %a{slot} = getelementptr ptr, ptr %args, i32 {param}");
                let _ = writeln!(out, "  %p{slot} = load ptr, ptr %a{slot}");
                let _ = writeln!(
                    out,
                    "  %q{slot} = getelementptr {}, ptr %p{slot}, i32 %index",
                    vt.llvm()
                );
                let _ = writeln!(out, "  store {} {}, ptr %q{slot}", vt.llvm(), value(*x));
            }
        }
    }

    out.push_str(
        "  br label %latch\n\nlatch:\n  %index_next = add i32 %index, 1\n  br label \
         %loop\n\nexit:\n  ret void\n}\n\nattributes #0 = { nounwind }\n",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::JitBackend;
    use crate::dtype::VarType;

    #[test]
    fn ir_emission_is_deterministic() {
        use crate::kernel::ParamKind;
        let kernel = ScheduledKernel {
            backend: JitBackend::Llvm,
            size: 64,
            ops: vec![
                KernelOp::Load { param: 0, vt: VarType::F32, broadcast: false },
                KernelOp::Unary { op: Op::Sqrt, vt: VarType::F32, x: 0 },
                KernelOp::Store { param: 1, vt: VarType::F32, x: 1 },
            ],
            params: vec![(1, ParamKind::Input), (2, ParamKind::Output)],
        };
        let mut a = String::new();
        let mut b = String::new();
        emit_ir(&kernel, "enoki_kernel", &mut a);
        emit_ir(&kernel, "enoki_kernel", &mut b);
        assert_eq!(a, b);
        assert!(a.contains("define void @enoki_kernel"));
        assert!(a.contains("@llvm.sqrt.float"));
        assert!(a.contains("ret void"));
    }
}
