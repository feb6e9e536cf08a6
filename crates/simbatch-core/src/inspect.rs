//! Script inspection — derive the core requirement of a batch script.
//!
//! Two sources feed the result: MPI-style `-np`/`-n` arguments inside the
//! script, and an OpenFOAM `decomposeParDict` near the case directory. The
//! larger of the two wins; anything unreadable counts as 1.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

/// Cores required by the script at `path`. Always ≥ 1.
pub fn required_cores(path: &Path) -> usize {
    let from_script = scan_script(path).unwrap_or(1);
    let from_dict = path
        .parent()
        .and_then(find_decompose_dict)
        .and_then(|dict| scan_decompose_dict(&dict))
        .unwrap_or(1);
    from_script.max(from_dict).max(1)
}

/// Largest `-np N` / `-n N` / `-np=N` value on a non-comment line.
fn scan_script(path: &Path) -> Option<usize> {
    let source = std::fs::read_to_string(path).ok()?;
    let mut max = None;
    for line in source.lines() {
        if is_comment(line) {
            continue;
        }
        for caps in np_regex().captures_iter(line) {
            if let Ok(n) = caps[1].parse::<usize>() {
                max = Some(max.map_or(n, |m: usize| m.max(n)));
            }
        }
    }
    max
}

/// Batch-file comments: first token starts with `REM` (any case) or `::`.
fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("::")
        || trimmed
            .get(..3)
            .map_or(false, |p| p.eq_ignore_ascii_case("rem"))
}

/// Look for `system/decomposeParDict` in the script's directory and up to
/// four levels above it.
fn find_decompose_dict(script_dir: &Path) -> Option<PathBuf> {
    std::iter::successors(Some(script_dir), |dir| dir.parent())
        .take(5)
        .map(|dir| dir.join("system").join("decomposeParDict"))
        .find(|candidate| candidate.is_file())
}

/// The `numberOfSubdomains N;` entry, if present and parsable.
fn scan_decompose_dict(path: &Path) -> Option<usize> {
    let source = std::fs::read_to_string(path).ok()?;
    subdomains_regex()
        .captures(&source)
        .and_then(|caps| caps[1].parse().ok())
}

fn np_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)-np?\s*=?\s*(\d+)").expect("valid -np regex"))
}

fn subdomains_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"numberOfSubdomains\s+(\d+)\s*;").expect("valid dict regex"))
}
