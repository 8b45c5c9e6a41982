//! Result classification: a pure function from `(language, exit code,
//! stdout, stderr)` to a user-visible error kind, plus output scrubbing.
//!
//! Exit-code dispatch is language-agnostic; language heuristics only run
//! for exit codes the table does not decide.

use crate::registry::Language;
use crate::MAX_OUTPUT_BYTES;
use crucible_common::SandboxErrorKind;
use regex::Regex;
use std::sync::LazyLock;

/// Job directories are mounted under /sandbox inside the container; any
/// path that leaks into output is rewritten before anything is stored.
static SANDBOX_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/sandbox/[^/ \n]+/").expect("sandbox path pattern"));

/// Replace container-internal job paths with `./`.
pub fn sanitize(output: &str) -> String {
    SANDBOX_PATH.replace_all(output, "./").into_owned()
}

/// Cap output at `limit` bytes, marking the cut.
pub fn truncate(output: &str, limit: usize) -> String {
    if output.len() <= limit {
        return output.to_string();
    }
    let mut end = limit;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [Output Truncated]", &output[..end])
}

/// Truncate then sanitize with the standard cap.
pub fn clean_output(output: &str) -> String {
    sanitize(&truncate(output, MAX_OUTPUT_BYTES))
}

/// Classify an exec outcome. `None` means a clean run.
///
/// The caller passes already-cleaned output; classification never sees raw
/// sandbox paths.
pub fn classify(
    language: Language,
    exit_code: i64,
    stdout: &str,
    stderr: &str,
) -> Option<(SandboxErrorKind, &'static str)> {
    let kind = match exit_code {
        0 => return None,
        // BusyBox `timeout` exits 124; 137 is SIGKILL (timeout -s KILL or
        // the kernel OOM killer); both surface as a time limit.
        124 | 137 => SandboxErrorKind::TimeLimit,
        // SIGSEGV / SIGBUS / SIGABRT
        139 | 136 | 134 => SandboxErrorKind::RuntimeError,
        _ => match detect_language_error(language, stdout, stderr) {
            Some(kind) => kind,
            None => SandboxErrorKind::RuntimeError,
        },
    };
    Some((kind, kind.message()))
}

/// Language-specific stderr/stdout heuristics for exit codes the table
/// does not decide. Some runtimes print errors to stdout, so runtime
/// signatures scan the combined output; compiler signatures only scan
/// stderr.
fn detect_language_error(language: Language, stdout: &str, stderr: &str) -> Option<SandboxErrorKind> {
    let combined = format!("{stdout}\n{stderr}");

    let (compile_signatures, runtime_signatures): (&[&str], &[&str]) = match language {
        Language::Cpp => (
            &["error:", "fatal error:", "undefined reference"],
            &["Segmentation fault", "core dumped", "abort", "floating point exception"],
        ),
        Language::Go => (
            &["undefined:", "cannot use", "no required module"],
            &["panic:", "runtime error:"],
        ),
        Language::Python => (
            &["SyntaxError", "IndentationError"],
            &["Traceback (most recent call last):"],
        ),
        Language::Java => (
            &["error:", "cannot find symbol", "symbol not found"],
            &["Exception in thread"],
        ),
        Language::JavaScript => (
            &["SyntaxError:"],
            &["TypeError:", "ReferenceError:", "UnhandledPromiseRejectionWarning"],
        ),
    };

    if compile_signatures.iter().any(|sig| stderr.contains(sig)) {
        return Some(SandboxErrorKind::CompilationError);
    }
    if runtime_signatures.iter().any(|sig| combined.contains(sig)) {
        return Some(SandboxErrorKind::RuntimeError);
    }

    if is_meaningful_runtime_error(stderr) {
        return Some(SandboxErrorKind::RuntimeError);
    }

    None
}

/// Last-resort stderr check: only real crash signals count. Warnings,
/// `[info]`/`[debug]` lines, and empty stderr are not errors.
fn is_meaningful_runtime_error(stderr: &str) -> bool {
    let s = stderr.to_lowercase();

    if s.trim().is_empty() {
        return false;
    }
    if s.contains("[info]") || s.contains("[debug]") || s.contains("note:") {
        return false;
    }
    if s.contains("warning") {
        return false;
    }

    const CRASH_PATTERNS: [&str; 14] = [
        "segmentation fault",
        "core dumped",
        "panic:",
        "runtime error",
        "traceback (most recent call last):",
        "exception in thread",
        "nullpointerexception",
        "typeerror:",
        "referenceerror:",
        "indexerror:",
        "valueerror:",
        "abort",
        "illegal instruction",
        "floating point exception",
    ];

    CRASH_PATTERNS.iter().any(|pat| s.contains(pat))
}
