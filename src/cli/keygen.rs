//! `coderun keygen`

use anyhow::{Context, Result};
use coderun_core::AuthStore;
use secrecy::ExposeSecret;
use std::io::Write;
use std::path::Path;

pub fn run(user: &str, admin: bool, append: Option<&Path>) -> Result<()> {
    let (key, hash) = AuthStore::mint_key();
    let snippet = config_snippet(user, &hash, admin);

    println!("API key (give this to the client, it is not stored anywhere):");
    println!("  {}", key.expose_secret());
    println!();
    match append {
        Some(path) => {
            append_snippet(path, &snippet)?;
            println!("Key hash appended to {}", path.display());
        }
        None => {
            println!("Add to config/local.toml:");
            println!();
            print!("{}", snippet);
        }
    }
    Ok(())
}

fn append_snippet(path: &Path, snippet: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    write!(file, "\n{}", snippet).with_context(|| format!("Failed to write {}", path.display()))
}

fn config_snippet(user: &str, hash: &str, admin: bool) -> String {
    let mut snippet = format!(
        "[[server.auth.api_keys]]\nuser = \"{}\"\nhash = \"{}\"\n",
        user, hash
    );
    if admin {
        snippet.push_str("admin = true\n");
    }
    snippet
}
