//! Pre-submission source validation.
//!
//! Validators run in the API path, before a job is ever enqueued. They are
//! a cheap first line: the sandbox itself (no network, tmpfs, pid/memory
//! limits) is the real boundary. Each validator enforces the shared size
//! and character-set rules plus a per-language denylist of syscall-adjacent
//! tokens.

use thiserror::Error;

/// Hard cap on submitted source size.
pub const MAX_CODE_BYTES: usize = 256 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("code too large (>256KB)")]
    TooLarge,

    #[error("contains invalid characters")]
    InvalidCharacters,

    #[error("missing required construct: {0}")]
    MissingConstruct(&'static str),

    #[error("code contains forbidden keyword: {0}")]
    ForbiddenKeyword(&'static str),
}

fn check_common(code: &str) -> Result<(), ValidationError> {
    if code.len() > MAX_CODE_BYTES {
        return Err(ValidationError::TooLarge);
    }
    for c in code.chars() {
        if !is_allowed_char(c) {
            return Err(ValidationError::InvalidCharacters);
        }
    }
    Ok(())
}

fn is_allowed_char(c: char) -> bool {
    c == '\n' || c == '\t' || (!c.is_control() && !matches!(c, '\u{7f}'))
}

fn check_denylist(code: &str, blocked: &[&'static str]) -> Result<(), ValidationError> {
    for bad in blocked {
        if code.contains(bad) {
            return Err(ValidationError::ForbiddenKeyword(bad));
        }
    }
    Ok(())
}

pub fn validate_cpp(code: &str) -> Result<(), ValidationError> {
    check_common(code)?;

    if !code.contains("main(") {
        return Err(ValidationError::MissingConstruct("main() function"));
    }

    check_denylist(
        code,
        &[
            "system(",
            "popen(",
            "execv",
            "fork(",
            "socket",
            "ofstream",
            "ifstream",
            "std::filesystem",
            "unistd.h",
            "netinet",
            "arpa",
            "dirent.h",
        ],
    )
}

pub fn validate_go(code: &str) -> Result<(), ValidationError> {
    check_common(code)?;

    if !code.contains("func main(") {
        return Err(ValidationError::MissingConstruct("func main()"));
    }

    check_denylist(
        code,
        &[
            "os/exec",
            "net/http",
            "\"net\"",
            "syscall",
            "unsafe",
            "os.Remove",
            "os.Create",
            "ioutil.WriteFile",
        ],
    )
}

pub fn validate_python(code: &str) -> Result<(), ValidationError> {
    check_common(code)?;

    check_denylist(
        code,
        &[
            "import os",
            "import sys",
            "subprocess",
            "eval(",
            "exec(",
            "open(",
            "__import__",
            "socket",
            "shutil",
            "pickle",
        ],
    )
}

pub fn validate_java(code: &str) -> Result<(), ValidationError> {
    check_common(code)?;

    if !code.contains("class ") {
        return Err(ValidationError::MissingConstruct("class declaration"));
    }
    if !code.contains("public static void main") {
        return Err(ValidationError::MissingConstruct("main method"));
    }

    check_denylist(
        code,
        &[
            "Runtime.getRuntime",
            "ProcessBuilder",
            "System.exit",
            "java.io.File",
            "java.nio.file",
            "java.net",
            "Executors",
            "ForkJoinPool",
        ],
    )
}

pub fn validate_javascript(code: &str) -> Result<(), ValidationError> {
    check_common(code)?;

    check_denylist(
        code,
        &[
            "require('child_process')",
            "require(\"child_process\")",
            "exec(",
            "spawn(",
            "fork(",
            "process.exit",
            "fs.writeFile",
            "fs.unlink",
            "fs.rm",
            "net.createServer",
            "dgram.createSocket",
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_boundary_is_inclusive() {
        // Exactly 256 KiB passes, one byte more is rejected.
        let body = "x".repeat(MAX_CODE_BYTES - 20);
        let code = format!("int main(){{//{body}");
        let code = format!("{code}{}", "y".repeat(MAX_CODE_BYTES - code.len()));
        assert_eq!(code.len(), MAX_CODE_BYTES);
        assert_eq!(validate_cpp(&code), Ok(()));

        let over = format!("{code}z");
        assert_eq!(validate_cpp(&over), Err(ValidationError::TooLarge));
    }

    #[test]
    fn control_characters_rejected() {
        assert_eq!(
            validate_python("print('hi')\u{0}"),
            Err(ValidationError::InvalidCharacters)
        );
        // Plain newlines and tabs are fine.
        assert_eq!(validate_python("x = 1\n\tprint(x)"), Ok(()));
    }

    #[test]
    fn python_denylist() {
        assert_eq!(
            validate_python("import os\nprint(1)"),
            Err(ValidationError::ForbiddenKeyword("import os"))
        );
        assert_eq!(
            validate_python("open('/etc/passwd')"),
            Err(ValidationError::ForbiddenKeyword("open("))
        );
        assert_eq!(validate_python("print(sum(range(10)))"), Ok(()));
    }

    #[test]
    fn java_requires_class_and_main() {
        assert_eq!(
            validate_java("public static void main"),
            Err(ValidationError::MissingConstruct("class declaration"))
        );
        assert_eq!(
            validate_java("class Main {}"),
            Err(ValidationError::MissingConstruct("main method"))
        );
        assert_eq!(
            validate_java("class Main { public static void main(String[] a) {} }"),
            Ok(())
        );
    }

    #[test]
    fn cpp_requires_main() {
        assert_eq!(
            validate_cpp("#include <cstdio>"),
            Err(ValidationError::MissingConstruct("main() function"))
        );
    }

    #[test]
    fn javascript_blocks_child_process() {
        assert_eq!(
            validate_javascript("const cp = require('child_process')"),
            Err(ValidationError::ForbiddenKeyword("require('child_process')"))
        );
        assert_eq!(validate_javascript("console.log([1,2].map(x => x * 2))"), Ok(()));
    }

    #[test]
    fn go_blocks_exec_and_requires_main() {
        assert_eq!(
            validate_go("package main\nimport \"os/exec\"\nfunc main() {}"),
            Err(ValidationError::ForbiddenKeyword("os/exec"))
        );
        assert_eq!(
            validate_go("package main\nimport \"fmt\"\nfunc main() { fmt.Println(1) }"),
            Ok(())
        );
    }
}
