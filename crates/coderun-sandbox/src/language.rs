//! Language profiles
//!
//! A profile names the file the source payload is written to and the
//! commands that build and run it. Commands are argv vectors with three
//! placeholders, expanded against the workspace directory the command
//! sees (host path in native mode, `/workspace` inside a container):
//!
//! - `{source}`: path of the source file
//! - `{binary}`: path the build step should produce
//! - `{workspace}`: the workspace directory itself

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Build and run commands for one language
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageProfile {
    /// File name the source payload is written to
    pub source_file: String,
    /// Optional build step argv
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    /// Program argv
    pub run: Vec<String>,
    /// Container image override for this language
    #[serde(default)]
    pub image: Option<String>,
}

const BINARY_NAME: &str = "program";

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

impl LanguageProfile {
    /// C compiled with the system `cc`
    #[must_use]
    pub fn c() -> Self {
        Self {
            source_file: "main.c".to_string(),
            // newer gcc rejects pre-C99 implicit declarations such as a bare printf
            compile: Some(argv(&[
                "cc",
                "-O2",
                "-Wno-error=implicit-function-declaration",
                "-o",
                "{binary}",
                "{source}",
                "-lm",
            ])),
            run: argv(&["{binary}"]),
            image: Some("gcc:13".to_string()),
        }
    }

    /// C++ compiled with the system `c++`
    #[must_use]
    pub fn cpp() -> Self {
        Self {
            source_file: "main.cpp".to_string(),
            compile: Some(argv(&["c++", "-O2", "-std=c++17", "-o", "{binary}", "{source}"])),
            run: argv(&["{binary}"]),
            image: Some("gcc:13".to_string()),
        }
    }

    /// Python 3, unbuffered so prompts reach the client
    #[must_use]
    pub fn python() -> Self {
        Self {
            source_file: "main.py".to_string(),
            compile: Some(argv(&["python3", "-m", "py_compile", "{source}"])),
            run: argv(&["python3", "-u", "{source}"]),
            image: Some("python:3.12-alpine".to_string()),
        }
    }

    /// POSIX shell, syntax-checked before running
    #[must_use]
    pub fn sh() -> Self {
        Self {
            source_file: "main.sh".to_string(),
            compile: Some(argv(&["sh", "-n", "{source}"])),
            run: argv(&["sh", "{source}"]),
            image: None,
        }
    }

    /// Built-in profiles keyed by name
    #[must_use]
    pub fn builtins() -> HashMap<String, LanguageProfile> {
        let mut map = HashMap::new();
        map.insert("c".to_string(), Self::c());
        map.insert("cpp".to_string(), Self::cpp());
        map.insert("python".to_string(), Self::python());
        map.insert("sh".to_string(), Self::sh());
        map
    }

    /// Reject profiles that cannot be materialized safely
    pub fn validate(&self, name: &str) -> Result<()> {
        let file = std::path::Path::new(&self.source_file);
        let plain = file.components().count() == 1
            && !self.source_file.is_empty()
            && !self.source_file.starts_with('.');
        if !plain {
            return Err(Error::InvalidInput(format!(
                "language '{name}': source_file must be a plain file name"
            )));
        }
        if self.run.is_empty() {
            return Err(Error::InvalidInput(format!(
                "language '{name}': run command is empty"
            )));
        }
        if matches!(&self.compile, Some(cmd) if cmd.is_empty()) {
            return Err(Error::InvalidInput(format!(
                "language '{name}': compile command is empty"
            )));
        }
        Ok(())
    }

    /// Expand the build step against `dir`
    #[must_use]
    pub fn compile_argv(&self, dir: &str) -> Option<Vec<String>> {
        self.compile.as_ref().map(|cmd| self.expand(cmd, dir))
    }

    /// Expand the program argv against `dir`
    #[must_use]
    pub fn run_argv(&self, dir: &str) -> Vec<String> {
        self.expand(&self.run, dir)
    }

    fn expand(&self, cmd: &[String], dir: &str) -> Vec<String> {
        let dir = dir.trim_end_matches('/');
        let source = format!("{dir}/{}", self.source_file);
        let binary = format!("{dir}/{BINARY_NAME}");
        cmd.iter()
            .map(|arg| {
                arg.replace("{source}", &source)
                    .replace("{binary}", &binary)
                    .replace("{workspace}", dir)
            })
            .collect()
    }
}
