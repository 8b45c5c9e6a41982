//! Language registry: the single closed enumeration used by the validator,
//! the runner, and the classifier. Adding a language is a change to this
//! file and nothing else.

use crate::validators;
use serde::{Deserialize, Serialize};

/// Supported execution languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Cpp,
    Go,
    Python,
    Java,
    #[serde(rename = "javascript")]
    JavaScript,
}

/// File names a job's source lands under inside the job directory.
#[derive(Debug, Clone)]
pub struct FileNames {
    /// "main" or "Main"
    pub base_name: String,
    /// "main.cpp", "Main.java", ...
    pub full_name: String,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Cpp,
        Language::Go,
        Language::Python,
        Language::Java,
        Language::JavaScript,
    ];

    /// Parse a wire tag. Tags are lowercase and stable.
    pub fn parse(tag: &str) -> Option<Language> {
        match tag {
            "cpp" => Some(Language::Cpp),
            "go" => Some(Language::Go),
            "python" => Some(Language::Python),
            "java" => Some(Language::Java),
            "javascript" => Some(Language::JavaScript),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::Go => "go",
            Language::Python => "python",
            Language::Java => "java",
            Language::JavaScript => "javascript",
        }
    }

    /// Docker image the pool warms for this language.
    pub fn image(self) -> &'static str {
        match self {
            Language::Cpp => "gcc:latest",
            Language::Go => "golang:1.23-alpine",
            Language::Python => "python:3.12-alpine",
            Language::Java => "eclipse-temurin:21-jdk-alpine",
            Language::JavaScript => "node:22-alpine",
        }
    }

    /// Java requires the public class to be `Main`; everything else is `main`.
    pub fn base_name(self) -> &'static str {
        match self {
            Language::Java => "Main",
            _ => "main",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::Go => "go",
            Language::Python => "py",
            Language::Java => "java",
            Language::JavaScript => "js",
        }
    }

    /// Credits debited for one clean execution.
    pub fn credit_cost(self) -> i64 {
        match self {
            Language::Cpp => 5,
            Language::Go => 4,
            Language::Python => 6,
            Language::Java => 7,
            Language::JavaScript => 5,
        }
    }

    pub fn file_names(self) -> FileNames {
        let base_name = self.base_name().to_string();
        let full_name = format!("{}.{}", base_name, self.extension());
        FileNames { base_name, full_name }
    }

    /// Shell snippet that compiles and runs the staged files. Executed with
    /// the job directory as the working directory; stdin is redirected from
    /// `input.txt`.
    pub fn run_command(self, names: &FileNames) -> String {
        match self {
            Language::Cpp => format!(
                "g++ {} -o {} && ./{} < input.txt",
                names.full_name, names.base_name, names.base_name
            ),
            Language::Go => format!(
                "go build -o {} {} && ./{} < input.txt",
                names.base_name, names.full_name, names.base_name
            ),
            Language::Python => format!("python3 {} < input.txt", names.full_name),
            Language::Java => format!(
                "javac {} && java {} < input.txt",
                names.full_name, names.base_name
            ),
            Language::JavaScript => format!("node {} < input.txt", names.full_name),
        }
    }

    /// Pre-submission source validation.
    pub fn validate(self, code: &str) -> Result<(), validators::ValidationError> {
        match self {
            Language::Cpp => validators::validate_cpp(code),
            Language::Go => validators::validate_go(code),
            Language::Python => validators::validate_python(code),
            Language::Java => validators::validate_java(code),
            Language::JavaScript => validators::validate_javascript(code),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}
