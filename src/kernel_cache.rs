//! Kernel cache: in-memory fingerprint map, shared-compile pending markers,
//! and the dictionary-compressed on-disk store.
//!
//! Disk layout, one file per kernel named by the 32-hex-digit fingerprint:
//!
//! ```text
//! magic  version  backend  reserved  src_size  comp_size  src_hash  art_size
//! u32    u16      u8       u8        u32       u32        u64       u32
//! ```
//!
//! followed by the LZ4-compressed source (seeded by the shared dictionary)
//! and the raw compiled artifact. Files failing any validation step are
//! ignored and recompiled.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use crate::backend::JitBackend;
use crate::hash::{Map, Set};
use crate::error::JitError;
use crate::kernel::{Fingerprint, Kernel};
use crate::log::jit_log;

const MAGIC: u32 = 0x454e_4b31; // "ENK1"
const VERSION: u16 = 2;
const HEADER_BYTES: usize = 28;

/// Compression dictionary shared by every kernel entry. Seeding LZ4 with
/// the boilerplate every kernel begins with roughly halves entry sizes.
/// Shipped in the binary and written to `kernels.dict` on first run.
pub(crate) const DICTIONARY: &[u8] = b".version 6.3\n.target sm_50\n.address_size 64\n\n\
.visible .entry enoki_(.param .u32 size, .param .u64 arg0, .param .u64 arg1) {\n    \
.reg.b32 %r<32>;\n    .reg.b64 %rd<32>;\n    .reg.f32 %f<32>;\n    .reg.f64 %d<32>;\n    \
.reg.pred %p<32>;\n    mov.u32 %r_idx, %ctaid.x;\n    mov.u32 %r_tid, %tid.x;\n    \
mad.lo.u32 %r_idx, %r_idx, %ntid.x, %r_tid;\n    ld.param.u32 %r_size, [size];\n    \
setp.ge.u32 %p_oob, %r_idx, %r_size;\n    @%p_oob bra DONE;\n    ld.param.u64 \
ld.global.b32 st.global.b32 mad.wide.u32 add.f32 mul.f32 fma.rn.f32 \
define void @enoki_(i32 %start, i32 %end, ptr %args) #0 {\nentry:\n  br label %loop\n\
loop:\n  %index = phi i32 [ %start, %entry ], [ %index_next, %latch ]\n  %done = icmp uge \
i32 %index, %end\n  br i1 %done, label %exit, label %body\n\nbody:\n  getelementptr ptr, \
ptr %args, i32   load ptr, ptr   load float, ptr   store float   br label %latch\n\n\
latch:\n  %index_next = add i32 %index, 1\n  br label %loop\n\nexit:\n  ret void\n}\n";

pub struct Pending {
    done: Mutex<bool>,
    signal: Condvar,
}

impl Pending {
    pub fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.signal.wait(done).unwrap();
        }
    }

    fn finish(&self) {
        *self.done.lock().unwrap() = true;
        self.signal.notify_all();
    }
}

/// Outcome of a cache probe under the global lock.
pub enum Probe {
    /// Kernel is resident
    Hit(Arc<Kernel>),
    /// Another thread is compiling this fingerprint; wait on the marker
    /// (with the lock released) and probe again
    InFlight(Arc<Pending>),
    /// This caller owns the compile; a marker was installed
    Miss { on_disk: bool },
}

pub struct KernelCache {
    kernels: Map<u128, Arc<Kernel>>,
    pending: Map<u128, Arc<Pending>>,
    /// Fingerprints present on disk, indexed lazily at init
    disk_index: Set<u128>,
    cache_dir: Option<PathBuf>,
    writers: Vec<std::thread::JoinHandle<()>>,
    pub hits: u64,
    pub soft_misses: u64,
    pub hard_misses: u64,
    pub launches: u64,
}

impl KernelCache {
    pub fn new() -> KernelCache {
        KernelCache {
            kernels: Map::default(),
            pending: Map::default(),
            disk_index: Set::default(),
            cache_dir: None,
            writers: Vec::new(),
            hits: 0,
            soft_misses: 0,
            hard_misses: 0,
            launches: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Resolve the per-user store, create it if needed (mode 0700 on
    /// POSIX), write the shipped dictionary on first run, and index the
    /// artifacts already present. Filenames only; entries open lazily.
    pub fn attach_disk(&mut self, dir: PathBuf) {
        if let Err(err) = init_dir(&dir) {
            jit_log!(Warn, "cache", "could not prepare \"{}\": {err}", dir.display());
            return;
        }
        let mut indexed = 0usize;
        if let Ok(entries) = fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(fp) = Fingerprint::from_hex(name) {
                    self.disk_index.insert(fp.0);
                    indexed += 1;
                }
            }
        }
        jit_log!(Info, "cache", "using \"{}\" ({indexed} indexed entries)", dir.display());
        self.cache_dir = Some(dir);
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Probe under the global lock. A `Miss` installs the pending marker;
    /// the caller must finish with [`KernelCache::insert`] or
    /// [`KernelCache::abandon`].
    pub fn probe(&mut self, fp: Fingerprint) -> Probe {
        if let Some(kernel) = self.kernels.get(&fp.0) {
            self.hits += 1;
            return Probe::Hit(kernel.clone());
        }
        if let Some(pending) = self.pending.get(&fp.0) {
            return Probe::InFlight(pending.clone());
        }
        let marker = Arc::new(Pending { done: Mutex::new(false), signal: Condvar::new() });
        self.pending.insert(fp.0, marker);
        Probe::Miss { on_disk: self.disk_index.contains(&fp.0) }
    }

    /// Publish a compiled kernel and wake blocked callers.
    pub fn insert(&mut self, kernel: Arc<Kernel>, from_disk: bool) {
        let fp = kernel.fingerprint;
        if from_disk {
            self.soft_misses += 1;
        } else {
            self.hard_misses += 1;
        }
        self.kernels.insert(fp.0, kernel);
        if let Some(pending) = self.pending.remove(&fp.0) {
            pending.finish();
        }
    }

    /// Remove the pending marker after a failed compile.
    pub fn abandon(&mut self, fp: Fingerprint) {
        if let Some(pending) = self.pending.remove(&fp.0) {
            pending.finish();
        }
    }

    /// Persist asynchronously on a writer thread. Joined at shutdown so a
    /// short-lived process still lands its entries.
    pub fn persist(&mut self, kernel: &Arc<Kernel>, artifact: Vec<u8>) {
        let Some(dir) = self.cache_dir.clone() else {
            return;
        };
        self.disk_index.insert(kernel.fingerprint.0);
        let kernel = kernel.clone();
        let handle = std::thread::spawn(move || {
            if let Err(err) = write_entry(&dir, &kernel, &artifact) {
                jit_log!(Warn, "cache", "failed to persist {}: {err}", kernel.fingerprint);
            }
        });
        self.writers.push(handle);
        // Bound the backlog without stalling the fast path
        if self.writers.len() > 64 {
            for handle in self.writers.drain(..) {
                let _ = handle.join();
            }
        }
    }

    /// Wait for outstanding writers and drop every kernel, returning them
    /// so backend-owned programs (CUDA modules) can be released properly.
    pub fn teardown(&mut self) -> Vec<Arc<Kernel>> {
        for handle in self.writers.drain(..) {
            let _ = handle.join();
        }
        for (_, pending) in self.pending.drain() {
            pending.finish();
        }
        self.disk_index.clear();
        self.cache_dir = None;
        self.hits = 0;
        self.soft_misses = 0;
        self.hard_misses = 0;
        self.launches = 0;
        self.kernels.drain().map(|(_, k)| k).collect()
    }
}

/// `$HOME/.enoki` on POSIX, `%TEMP%/enoki` on Windows.
pub(crate) fn default_cache_dir() -> Option<PathBuf> {
    #[cfg(unix)]
    {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".enoki"))
    }
    #[cfg(not(unix))]
    {
        std::env::var_os("TEMP").map(|tmp| PathBuf::from(tmp).join("enoki"))
    }
}

fn init_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }
    }
    let dict_path = dir.join("kernels.dict");
    if !dict_path.exists() {
        fs::write(&dict_path, DICTIONARY)?;
    }
    Ok(())
}

fn write_entry(dir: &Path, kernel: &Kernel, artifact: &[u8]) -> std::io::Result<()> {
    let compressed =
        lz4_flex::block::compress_prepend_size_with_dict(kernel.source.as_bytes(), DICTIONARY);
    let src_hash = xxhash_rust::xxh3::xxh3_64(kernel.source.as_bytes());

    let mut header = Vec::with_capacity(HEADER_BYTES);
    header.extend_from_slice(&MAGIC.to_le_bytes());
    header.extend_from_slice(&VERSION.to_le_bytes());
    header.push(kernel.backend as u8);
    header.push(0);
    header.extend_from_slice(&(kernel.source.len() as u32).to_le_bytes());
    header.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    header.extend_from_slice(&src_hash.to_le_bytes());
    header.extend_from_slice(&(artifact.len() as u32).to_le_bytes());
    debug_assert_eq!(header.len(), HEADER_BYTES);

    // Write-then-rename keeps concurrent readers off half-written entries
    let final_path = dir.join(kernel.fingerprint.to_hex());
    let tmp_path = dir.join(format!("{}.tmp.{}", kernel.fingerprint.to_hex(), std::process::id()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&header)?;
        file.write_all(&compressed)?;
        file.write_all(artifact)?;
    }
    fs::rename(&tmp_path, &final_path)?;
    jit_log!(
        Debug,
        "cache",
        "persisted {} ({} -> {} bytes source, {} bytes artifact)",
        kernel.fingerprint,
        kernel.source.len(),
        compressed.len(),
        artifact.len()
    );
    Ok(())
}

/// Read and validate one on-disk entry. Corruption is reported so the
/// caller can fall back to a fresh compile; the broken file stays in
/// place and is simply overwritten by the next persist.
pub(crate) fn read_entry(
    path: &Path,
    fp: Fingerprint,
) -> Result<(JitBackend, String, Vec<u8>), JitError> {
    let corrupt = |what: &str| JitError::CorruptCacheEntry(format!("{}: {what}", fp.to_hex()).into());

    let mut file = fs::File::open(path)?;
    let mut header = [0u8; HEADER_BYTES];
    file.read_exact(&mut header).map_err(|_| corrupt("truncated header"))?;

    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
    if magic != MAGIC {
        return Err(corrupt("magic mismatch"));
    }
    if version != VERSION {
        return Err(corrupt("version mismatch"));
    }
    let backend = JitBackend::from_u8(header[6]).ok_or_else(|| corrupt("bad backend tag"))?;
    let src_size = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
    let comp_size = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;
    let src_hash = u64::from_le_bytes(header[16..24].try_into().unwrap());
    let art_size = u32::from_le_bytes(header[24..28].try_into().unwrap()) as usize;

    let mut compressed = vec![0u8; comp_size];
    file.read_exact(&mut compressed).map_err(|_| corrupt("truncated source"))?;
    let mut artifact = vec![0u8; art_size];
    file.read_exact(&mut artifact).map_err(|_| corrupt("truncated artifact"))?;

    let source = lz4_flex::block::decompress_size_prepended_with_dict(&compressed, DICTIONARY)
        .map_err(|_| corrupt("decompression failed"))?;
    if source.len() != src_size {
        return Err(corrupt("source size mismatch"));
    }
    if xxhash_rust::xxh3::xxh3_64(&source) != src_hash {
        return Err(corrupt("source hash mismatch"));
    }
    let source = String::from_utf8(source).map_err(|_| corrupt("source is not UTF-8"))?;
    Ok((backend, source, artifact))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Program;

    fn dummy_kernel(source: &str) -> Arc<Kernel> {
        Arc::new(Kernel {
            backend: JitBackend::Dummy,
            fingerprint: Fingerprint::compute(source, "dummy;w1"),
            source: source.into(),
            entry: "enoki_test".into(),
            program: Program::Interp { ops: Arc::new(Vec::new()) },
            size: 0,
        })
    }

    #[test]
    fn entry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        init_dir(dir.path()).unwrap();
        let kernel = dummy_kernel("// kernel backend=dummy size=3\n%0 = Index\n");
        write_entry(dir.path(), &kernel, b"artifact-bytes").unwrap();

        let path = dir.path().join(kernel.fingerprint.to_hex());
        let (backend, source, artifact) = read_entry(&path, kernel.fingerprint).unwrap();
        assert_eq!(backend, JitBackend::Dummy);
        assert_eq!(source, kernel.source);
        assert_eq!(artifact, b"artifact-bytes");

        // Identical source + device key reproduces the file name
        assert_eq!(Fingerprint::compute(&source, "dummy;w1"), kernel.fingerprint);
    }

    #[test]
    fn corrupt_entries_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        init_dir(dir.path()).unwrap();
        let kernel = dummy_kernel("%0 = Index\n");
        write_entry(dir.path(), &kernel, b"x").unwrap();
        let path = dir.path().join(kernel.fingerprint.to_hex());

        // Flip one byte of the compressed payload
        let mut bytes = fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[HEADER_BYTES + 4] ^= 0xff;
        fs::write(&path, &bytes[..n]).unwrap();
        assert!(matches!(
            read_entry(&path, kernel.fingerprint),
            Err(JitError::CorruptCacheEntry(_))
        ));

        // Magic mismatch
        bytes[0] ^= 0xff;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read_entry(&path, kernel.fingerprint),
            Err(JitError::CorruptCacheEntry(_))
        ));
    }
}
