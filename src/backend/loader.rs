//! Locating and opening the GPU driver / LLVM shared libraries at runtime.

use std::path::{Path, PathBuf};

use libloading::Library;

use crate::log::jit_log;

/// Natural version order: digit runs compare numerically, everything else
/// lexicographically. `libfoo.so.9` sorts before `libfoo.so.10`.
pub(crate) fn natural_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut i = 0;
    let mut j = 0;
    while i < a.len() && j < b.len() {
        if a[i].is_ascii_digit() && b[j].is_ascii_digit() {
            let i0 = i;
            let j0 = j;
            while i < a.len() && a[i].is_ascii_digit() {
                i += 1;
            }
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            // Leading zeros cannot overflow u64 for any realistic soname
            let ai: u64 = std::str::from_utf8(&a[i0..i]).unwrap().parse().unwrap_or(u64::MAX);
            let bj: u64 = std::str::from_utf8(&b[j0..j]).unwrap().parse().unwrap_or(u64::MAX);
            match ai.cmp(&bj) {
                Ordering::Equal => {}
                ord => return ord,
            }
        } else {
            match a[i].cmp(&b[j]) {
                Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
                ord => return ord,
            }
        }
    }
    a.len().cmp(&b.len())
}

/// Collect candidate files matching `prefix*` inside `dir`.
fn scan_dir(dir: &Path, prefix: &str, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(prefix) {
            out.push(entry.path());
        }
    }
}

/// Find and open a shared library by canonical name.
///
/// An environment variable override wins when set; if it cannot be opened
/// the search gives up rather than silently picking something else. Without
/// an override, every `search_dirs` directory is scanned for `prefix*`
/// candidates; symbolic links are skipped when a regular file exists, and
/// the candidate that sorts last under the natural version order is opened.
///
/// Failure is not an error; the caller downgrades the backend.
pub(crate) fn find_library(prefix: &str, search_dirs: &[&str], env_var: &str) -> Option<Library> {
    if let Ok(path) = std::env::var(env_var) {
        if !path.is_empty() {
            return match unsafe { Library::new(&path) } {
                Ok(lib) => Some(lib),
                Err(err) => {
                    jit_log!(Warn, "loader", "unable to load \"{path}\" ({env_var}): {err}");
                    None
                }
            };
        }
    }

    let mut candidates = Vec::new();
    for dir in search_dirs {
        scan_dir(Path::new(dir), prefix, &mut candidates);
    }
    if candidates.is_empty() {
        return None;
    }

    let any_regular = candidates.iter().any(|p| {
        std::fs::symlink_metadata(p).map(|m| !m.file_type().is_symlink()).unwrap_or(false)
    });
    if any_regular {
        candidates.retain(|p| {
            std::fs::symlink_metadata(p).map(|m| !m.file_type().is_symlink()).unwrap_or(false)
        });
    }

    candidates.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));

    if candidates.len() > 1 {
        jit_log!(
            Info,
            "loader",
            "multiple versions of {prefix} found, set {env_var} to override:"
        );
        for (i, c) in candidates.iter().enumerate() {
            jit_log!(Info, "loader", " {}. \"{}\"", i + 1, c.display());
        }
    }

    // Largest version wins; fall back through the rest if it fails to open
    for candidate in candidates.iter().rev() {
        match unsafe { Library::new(candidate) } {
            Ok(lib) => {
                jit_log!(Info, "loader", "loaded \"{}\"", candidate.display());
                return Some(lib);
            }
            Err(err) => {
                jit_log!(Debug, "loader", "skipping \"{}\": {err}", candidate.display());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::natural_cmp;
    use std::cmp::Ordering;

    #[test]
    fn digit_runs_compare_numerically() {
        assert_eq!(natural_cmp("libcuda.so.9", "libcuda.so.10"), Ordering::Less);
        assert_eq!(natural_cmp("libLLVM-15.so", "libLLVM-9.so"), Ordering::Greater);
        assert_eq!(natural_cmp("libLLVM-15.0.7.so", "libLLVM-15.0.12.so"), Ordering::Less);
    }

    #[test]
    fn nondigit_runs_compare_lexicographically() {
        assert_eq!(natural_cmp("liba.so", "libb.so"), Ordering::Less);
        assert_eq!(natural_cmp("libcuda.so", "libcuda.so"), Ordering::Equal);
        assert_eq!(natural_cmp("libcuda.so", "libcuda.so.1"), Ordering::Less);
    }

    #[test]
    fn mixed_runs() {
        assert_eq!(natural_cmp("libLLVM-9.so.1", "libLLVM-9.so.2"), Ordering::Less);
        assert_eq!(natural_cmp("libLLVM-10.so", "libLLVM-10.so"), Ordering::Equal);
    }
}
