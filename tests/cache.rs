//! Kernel cache persistence: reuse across restarts, corrupt-entry
//! recovery, and the dictionary bootstrap. Each test points `$HOME` at a
//! scratch directory and simulates a process restart by shutting the JIT
//! down and initializing it again.

use enoki_jit as jit;
use jit::{JitBackend, Op, VarType};
use serial_test::serial;

const B: JitBackend = JitBackend::Dummy;

fn init_in(home: &tempfile::TempDir) {
    std::env::set_var("HOME", home.path());
    jit::init_dummy().unwrap();
}

/// Build and evaluate a small kernel, returning the result.
fn run_workload() -> f32 {
    let a = jit::var_literal(B, 1.5f32, 1);
    let x = jit::var_counter(B, 16);
    let xf = jit::var_op(Op::Cast, VarType::F32, &[x]).unwrap();
    let y = jit::var_op(Op::Fma, VarType::F32, &[xf, a, a]).unwrap();
    let value = jit::var_read(y, 4).unwrap();
    for id in [y, xf, x, a] {
        jit::var_dec_ref(id);
    }
    value
}

#[test]
#[serial]
fn kernels_survive_process_restarts() {
    let home = tempfile::tempdir().unwrap();

    // First "process": everything is a hard miss
    init_in(&home);
    assert_eq!(run_workload(), 7.5);
    let stats = jit::kernel_stats();
    assert_eq!(stats.hard_misses, 1);
    assert_eq!(stats.soft_misses, 0);
    jit::shutdown().unwrap();

    // The store now holds the dictionary and one kernel entry
    let cache_dir = home.path().join(".enoki");
    assert!(cache_dir.join("kernels.dict").is_file());
    let entries: Vec<_> = std::fs::read_dir(&cache_dir)
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().len() == 32)
        .collect();
    assert_eq!(entries.len(), 1);

    // Second "process": the kernel loads from disk, nothing compiles
    init_in(&home);
    assert_eq!(run_workload(), 7.5);
    let stats = jit::kernel_stats();
    assert_eq!(stats.hard_misses, 0);
    assert_eq!(stats.soft_misses, 1);

    // And a second in-process evaluation is a plain hit
    assert_eq!(run_workload(), 7.5);
    assert_eq!(jit::kernel_stats().hits, 1);
    jit::shutdown().unwrap();
}

#[test]
#[serial]
fn corrupt_entries_are_recompiled() {
    let home = tempfile::tempdir().unwrap();

    init_in(&home);
    assert_eq!(run_workload(), 7.5);
    jit::shutdown().unwrap();

    // Truncate the persisted entry
    let cache_dir = home.path().join(".enoki");
    let entry = std::fs::read_dir(&cache_dir)
        .unwrap()
        .flatten()
        .find(|e| e.file_name().len() == 32)
        .unwrap();
    let bytes = std::fs::read(entry.path()).unwrap();
    std::fs::write(entry.path(), &bytes[..bytes.len() / 2]).unwrap();

    // The damaged file is ignored; the kernel compiles again and the
    // entry is rewritten
    init_in(&home);
    assert_eq!(run_workload(), 7.5);
    let stats = jit::kernel_stats();
    assert_eq!(stats.soft_misses, 0);
    assert_eq!(stats.hard_misses, 1);
    jit::shutdown().unwrap();

    let restored = std::fs::read(entry.path()).unwrap();
    assert_eq!(restored.len(), bytes.len());
}

#[test]
#[serial]
fn distinct_kernels_get_distinct_entries() {
    let home = tempfile::tempdir().unwrap();
    init_in(&home);

    assert_eq!(run_workload(), 7.5);
    // A structurally different kernel
    let x = jit::var_counter(B, 16);
    let two = jit::var_literal(B, 2u32, 1);
    let y = jit::var_op(Op::Shl, VarType::U32, &[x, two]).unwrap();
    assert_eq!(jit::var_read::<u32>(y, 3).unwrap(), 12);
    for id in [y, two, x] {
        jit::var_dec_ref(id);
    }
    assert_eq!(jit::kernel_stats().hard_misses, 2);
    jit::shutdown().unwrap();

    let cache_dir = home.path().join(".enoki");
    let entries = std::fs::read_dir(&cache_dir)
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().len() == 32)
        .count();
    assert_eq!(entries, 2);
}

#[test]
#[serial]
fn dictionary_is_written_once() {
    let home = tempfile::tempdir().unwrap();

    init_in(&home);
    jit::shutdown().unwrap();
    let dict_path = home.path().join(".enoki").join("kernels.dict");
    let first = std::fs::metadata(&dict_path).unwrap().modified().unwrap();

    init_in(&home);
    jit::shutdown().unwrap();
    let second = std::fs::metadata(&dict_path).unwrap().modified().unwrap();
    assert_eq!(first, second);
}
