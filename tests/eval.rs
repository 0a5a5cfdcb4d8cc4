//! End-to-end evaluation against the host test device: kernel fusion,
//! fingerprint stability, scatter ordering, and leak detection.

use enoki_jit as jit;
use jit::{JitBackend, Op, VarType};
use serial_test::serial;

const B: JitBackend = JitBackend::Dummy;

fn init_in(home: &tempfile::TempDir) {
    std::env::set_var("HOME", home.path());
    jit::init_dummy().unwrap();
}

#[test]
#[serial]
fn scalar_fold() {
    let home = tempfile::tempdir().unwrap();
    init_in(&home);

    let a = jit::var_literal(B, 3.0f32, 1);
    let b = jit::var_literal(B, 4.0f32, 1);
    let s1 = jit::var_op(Op::Add, VarType::F32, &[a, b]).unwrap();
    let s2 = jit::var_op(Op::Add, VarType::F32, &[a, b]).unwrap();
    assert_eq!(s1, s2);

    let stats_before = jit::kernel_stats();
    let value: f32 = jit::var_read(s1, 0).unwrap();
    assert_eq!(value, 7.0);
    let stats = jit::kernel_stats();
    assert_eq!(stats.launches, stats_before.launches + 1);
    assert_eq!(stats.hard_misses, stats_before.hard_misses + 1);
    assert!(jit::var_is_evaluated(s1));

    for id in [s1, s2, a, b] {
        jit::var_dec_ref(id);
    }
    assert_eq!(jit::n_variables(), 0);
    jit::shutdown().unwrap();
}

#[test]
#[serial]
fn fingerprints_are_stable_within_a_process() {
    let home = tempfile::tempdir().unwrap();
    init_in(&home);

    let run = || -> f32 {
        let a = jit::var_literal(B, 2.0f32, 1);
        let x = jit::var_counter(B, 32);
        let xf = jit::var_op(Op::Cast, VarType::F32, &[x]).unwrap();
        let y = jit::var_op(Op::Mul, VarType::F32, &[xf, a]).unwrap();
        let value = jit::var_read(y, 3).unwrap();
        for id in [y, xf, x, a] {
            jit::var_dec_ref(id);
        }
        value
    };

    assert_eq!(run(), 6.0);
    let stats1 = jit::kernel_stats();
    assert_eq!(run(), 6.0);
    let stats2 = jit::kernel_stats();

    // The second pass reuses the first pass's kernel: identical graphs
    // emit identical source, hence identical fingerprints
    assert_eq!(stats2.hard_misses, stats1.hard_misses);
    assert_eq!(stats2.soft_misses, stats1.soft_misses);
    assert_eq!(stats2.hits, stats1.hits + 1);

    assert_eq!(jit::n_variables(), 0);
    jit::shutdown().unwrap();
}

#[test]
#[serial]
fn broadcast_evaluates() {
    let home = tempfile::tempdir().unwrap();
    init_in(&home);

    let a = jit::var_counter(B, 1000);
    let b = jit::var_literal(B, 5u32, 1);
    let c = jit::var_op(Op::Add, VarType::U32, &[a, b]).unwrap();
    assert_eq!(jit::var_read::<u32>(c, 0).unwrap(), 5);
    assert_eq!(jit::var_read::<u32>(c, 999).unwrap(), 1004);

    for id in [a, b, c] {
        jit::var_dec_ref(id);
    }
    jit::shutdown().unwrap();
}

#[test]
#[serial]
fn select_and_compare() {
    let home = tempfile::tempdir().unwrap();
    init_in(&home);

    // select(i < 4, i * 10, i) over 8 lanes
    let i = jit::var_counter(B, 8);
    let four = jit::var_literal(B, 4u32, 1);
    let ten = jit::var_literal(B, 10u32, 1);
    let mask = jit::var_op(Op::Lt, VarType::Bool, &[i, four]).unwrap();
    let scaled = jit::var_op(Op::Mul, VarType::U32, &[i, ten]).unwrap();
    let sel = jit::var_op(Op::Select, VarType::U32, &[mask, scaled, i]).unwrap();

    assert_eq!(jit::var_read::<u32>(sel, 2).unwrap(), 20);
    assert_eq!(jit::var_read::<u32>(sel, 6).unwrap(), 6);

    for id in [i, four, ten, mask, scaled, sel] {
        jit::var_dec_ref(id);
    }
    jit::shutdown().unwrap();
}

#[test]
#[serial]
fn scatter_ordering_is_preserved() {
    let home = tempfile::tempdir().unwrap();
    init_in(&home);

    let buf = jit::var_data(B, &[0u32; 10]).unwrap();
    let idx = jit::var_data(B, &[0u32, 1]).unwrap();
    let v1 = jit::var_data(B, &[7u32, 8]).unwrap();
    let v2 = jit::var_data(B, &[9u32, 10]).unwrap();

    let s1 = jit::var_scatter(buf, idx, v1, 0).unwrap();
    let s2 = jit::var_scatter(buf, idx, v2, 0).unwrap();
    // Side effects are never merged by CSE
    assert_ne!(s1, s2);

    // Reading the target flushes both writes in program order
    let zero = jit::var_literal(B, 0u32, 1);
    let g = jit::var_gather(buf, zero, 0).unwrap();
    assert_eq!(jit::var_read::<u32>(g, 0).unwrap(), 9);
    assert_eq!(jit::var_read::<u32>(buf, 1).unwrap(), 10);
    assert_eq!(jit::var_read::<u32>(buf, 2).unwrap(), 0);

    for id in [s1, s2, g, zero, v2, v1, idx, buf] {
        jit::var_dec_ref(id);
    }
    assert_eq!(jit::n_variables(), 0);
    jit::shutdown().unwrap();
}

#[test]
#[serial]
fn swapped_scatters_change_the_result() {
    let home = tempfile::tempdir().unwrap();
    init_in(&home);

    let buf = jit::var_data(B, &[0u32; 10]).unwrap();
    let idx = jit::var_data(B, &[0u32, 1]).unwrap();
    let v1 = jit::var_data(B, &[7u32, 8]).unwrap();
    let v2 = jit::var_data(B, &[9u32, 10]).unwrap();

    let s1 = jit::var_scatter(buf, idx, v2, 0).unwrap();
    let s2 = jit::var_scatter(buf, idx, v1, 0).unwrap();
    assert_eq!(jit::var_read::<u32>(buf, 0).unwrap(), 7);

    for id in [s1, s2, v2, v1, idx, buf] {
        jit::var_dec_ref(id);
    }
    jit::shutdown().unwrap();
}

#[test]
#[serial]
fn gather_with_computed_indices() {
    let home = tempfile::tempdir().unwrap();
    init_in(&home);

    let src = jit::var_data(B, &[10u32, 11, 12, 13, 14, 15, 16, 17]).unwrap();
    // Read the array back to front
    let i = jit::var_counter(B, 8);
    let seven = jit::var_literal(B, 7u32, 1);
    let rev = jit::var_op(Op::Sub, VarType::U32, &[seven, i]).unwrap();
    let g = jit::var_gather(src, rev, 0).unwrap();

    assert_eq!(jit::var_read::<u32>(g, 0).unwrap(), 17);
    assert_eq!(jit::var_read::<u32>(g, 7).unwrap(), 10);

    for id in [src, i, seven, rev, g] {
        jit::var_dec_ref(id);
    }
    jit::shutdown().unwrap();
}

#[test]
#[serial]
fn mixed_sizes_split_into_multiple_kernels() {
    let home = tempfile::tempdir().unwrap();
    init_in(&home);

    // A scalar subexpression feeding a wide one must evaluate first and
    // broadcast into the second kernel
    let two = jit::var_literal(B, 2.0f32, 1);
    let three = jit::var_literal(B, 3.0f32, 1);
    let scale = jit::var_op(Op::Mul, VarType::F32, &[two, three]).unwrap();

    let i = jit::var_counter(B, 100);
    let xf = jit::var_op(Op::Cast, VarType::F32, &[i]).unwrap();
    let y = jit::var_op(Op::Mul, VarType::F32, &[xf, scale]).unwrap();

    let stats_before = jit::kernel_stats();
    assert_eq!(jit::var_read::<f32>(y, 10).unwrap(), 60.0);
    let stats = jit::kernel_stats();
    assert_eq!(stats.launches, stats_before.launches + 2);

    for id in [two, three, scale, i, xf, y] {
        jit::var_dec_ref(id);
    }
    jit::shutdown().unwrap();
}

#[test]
#[serial]
fn write_copies_shared_storage() {
    let home = tempfile::tempdir().unwrap();
    init_in(&home);

    let a = jit::var_data(B, &[1u32, 2, 3, 4]).unwrap();
    jit::var_inc_ref(a); // second observer
    let b = jit::var_write(a, 2, 99u32).unwrap();
    assert_ne!(a, b);
    assert_eq!(jit::var_read::<u32>(a, 2).unwrap(), 3);
    assert_eq!(jit::var_read::<u32>(b, 2).unwrap(), 99);

    jit::var_dec_ref(a);
    jit::var_dec_ref(a);
    jit::var_dec_ref(b);
    assert_eq!(jit::n_variables(), 0);
    jit::shutdown().unwrap();
}

#[test]
#[serial]
fn resize_and_print() {
    let home = tempfile::tempdir().unwrap();
    init_in(&home);

    let half = jit::var_literal(B, 0.5f32, 1);
    let wide = jit::var_resize(half, 4).unwrap();
    assert_eq!(jit::var_size(wide).unwrap(), 4);
    assert_eq!(jit::var_read::<f32>(wide, 3).unwrap(), 0.5);

    let data = jit::var_data(B, &[1u32, 2, 3]).unwrap();
    assert_eq!(jit::var_str(data).unwrap(), "[1, 2, 3]");
    let big = jit::var_counter(B, 100);
    let text = jit::var_str(big).unwrap();
    assert!(text.starts_with("[0, 1,"));
    assert!(text.contains(".. 80 skipped .."));
    assert!(text.ends_with("98, 99]"));

    for id in [half, wide, data, big] {
        jit::var_dec_ref(id);
    }
    jit::shutdown().unwrap();
}

#[test]
#[serial]
fn leak_detector_counts_survivors() {
    let home = tempfile::tempdir().unwrap();
    init_in(&home);

    // Fully released graph: clean shutdown
    let a = jit::var_literal(B, 1u32, 1);
    let b = jit::var_op(Op::Add, VarType::U32, &[a, a]).unwrap();
    jit::var_dec_ref(b);
    jit::var_dec_ref(a);
    assert_eq!(jit::n_variables(), 0);
    jit::shutdown().unwrap();

    // One surviving handle: shutdown reports exactly one leak
    init_in(&home);
    let kept = jit::var_literal(B, 2u32, 1);
    let dropped = jit::var_op(Op::Add, VarType::U32, &[kept, kept]).unwrap();
    jit::var_dec_ref(dropped);
    match jit::shutdown() {
        Err(jit::JitError::LeakDetected { leaked }) => assert_eq!(leaked, 1),
        other => panic!("expected a leak report, got {other:?}"),
    }
}

#[test]
#[serial]
fn sync_thread_makes_results_observable() {
    let home = tempfile::tempdir().unwrap();
    init_in(&home);

    let i = jit::var_counter(B, 100_000);
    let one = jit::var_literal(B, 1u32, 1);
    let j = jit::var_op(Op::Add, VarType::U32, &[i, one]).unwrap();
    jit::var_schedule(j).unwrap();
    jit::eval().unwrap();
    jit::sync_thread();
    assert!(jit::var_is_evaluated(j));
    assert_eq!(jit::var_read::<u32>(j, 99_999).unwrap(), 100_000);

    for id in [i, one, j] {
        jit::var_dec_ref(id);
    }
    jit::shutdown().unwrap();
}

#[test]
#[serial]
fn launch_after_shutdown_fails() {
    let home = tempfile::tempdir().unwrap();
    init_in(&home);
    jit::shutdown().unwrap();

    let a = jit::var_literal(B, 1u32, 1);
    let b = jit::var_op(Op::Add, VarType::U32, &[a, a]).unwrap();
    match jit::var_eval(b) {
        Err(jit::JitError::BackendUnavailable(_)) | Err(jit::JitError::ShutdownInProgress) => {}
        other => panic!("expected unavailable backend, got {other:?}"),
    }
    jit::var_dec_ref(b);
    jit::var_dec_ref(a);
}
