//! Token persistence and the interactive authorization prompt.

use anyhow::{anyhow, Context, Result};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::token::TokenPair;

pub const ACCESS_TOKEN_KEY: &str = "NETATMO_ACCESS_TOKEN";
pub const REFRESH_TOKEN_KEY: &str = "NETATMO_REFRESH_TOKEN";

/// Durable home for the current token pair.
pub trait TokenStore: Send + Sync {
    fn persist(&self, tokens: &TokenPair) -> Result<()>;
}

/// Obtains an authorization code after the user has visited `auth_url`.
pub trait AuthorizationPrompt: Send + Sync {
    fn authorization_code(&self, auth_url: &str) -> Result<String>;
}

/// Rewrites the token lines of a dotenv-style file, leaving every other line
/// untouched. Missing keys are appended; a missing file is created.
#[derive(Clone, Debug)]
pub struct EnvFileTokenStore {
    path: PathBuf,
}

impl EnvFileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tokens saved by an earlier run, as `(access, refresh)`. A missing
    /// file yields neither.
    pub fn load(&self) -> Result<(Option<String>, Option<String>)> {
        let existing = self.read_existing()?;
        let mut access = None;
        let mut refresh = None;
        for line in existing.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if value.is_empty() {
                continue;
            }
            match env_line_key(key) {
                ACCESS_TOKEN_KEY => access = Some(value.to_string()),
                REFRESH_TOKEN_KEY => refresh = Some(value.to_string()),
                _ => {}
            }
        }
        Ok((access, refresh))
    }

    fn read_existing(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("read {}", self.path.display())),
        }
    }
}

impl TokenStore for EnvFileTokenStore {
    fn persist(&self, tokens: &TokenPair) -> Result<()> {
        let existing = self.read_existing()?;

        let mut updates = vec![(ACCESS_TOKEN_KEY, tokens.access_token.as_str())];
        if let Some(refresh) = tokens.refresh_token.as_deref() {
            updates.push((REFRESH_TOKEN_KEY, refresh));
        }
        let rendered = upsert_env_lines(&existing, &updates);

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, rendered)
            .with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        log::info!("tokens saved to {}", self.path.display());
        Ok(())
    }
}

fn env_line_key(raw: &str) -> &str {
    raw.trim_start().trim_start_matches("export ").trim()
}

fn upsert_env_lines(existing: &str, updates: &[(&str, &str)]) -> String {
    let mut seen = vec![false; updates.len()];
    let mut out = String::with_capacity(existing.len() + 256);
    for line in existing.lines() {
        let key = env_line_key(line.split('=').next().unwrap_or(""));
        match updates.iter().position(|(k, _)| *k == key) {
            Some(i) => {
                out.push_str(&format!("{}={}\n", updates[i].0, updates[i].1));
                seen[i] = true;
            }
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    for ((key, value), seen) in updates.iter().zip(seen) {
        if !seen {
            out.push_str(&format!("{}={}\n", key, value));
        }
    }
    out
}

/// Keeps every persisted pair in memory. Useful for tests and for
/// deployments that must not write credentials to disk.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    saved: Mutex<Vec<TokenPair>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<TokenPair> {
        self.saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl TokenStore for MemoryTokenStore {
    fn persist(&self, tokens: &TokenPair) -> Result<()> {
        self.saved
            .lock()
            .map_err(|_| anyhow!("memory token store lock poisoned"))?
            .push(tokens.clone());
        Ok(())
    }
}

/// Prints the authorization URL and reads the code from standard input.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdinPrompt;

impl AuthorizationPrompt for StdinPrompt {
    fn authorization_code(&self, auth_url: &str) -> Result<String> {
        println!("Visit the following URL to authorize the collector:\n{}", auth_url);
        print!("Enter the authorization code: ");
        std::io::stdout().flush().context("flush stdout")?;
        let mut line = String::new();
        let read = std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("read authorization code")?;
        let code = line.trim();
        if read == 0 || code.is_empty() {
            return Err(anyhow!("no authorization code entered"));
        }
        Ok(code.to_string())
    }
}
