//! Decryption of `encrypted_` source entries and encrypted externals.
use std::fmt;
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::error::SourceError;
use crate::exec;

/// An encryption tool.
pub trait Encryption: Send + Sync + fmt::Debug {
    /// Plaintext of `ciphertext`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool is missing or fails.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Ciphertext of `plaintext`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool is missing or fails.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Suffix stripped from encrypted source file names, e.g. `.age`.
    fn encrypted_suffix(&self) -> &str;
}

/// Used when no tool is configured. Every operation fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEncryption;

impl Encryption for NoEncryption {
    fn decrypt(&self, _ciphertext: &[u8]) -> Result<Vec<u8>> {
        Err(SourceError::EncryptionNotConfigured {
            path: "decrypt".to_string(),
        }
        .into())
    }

    fn encrypt(&self, _plaintext: &[u8]) -> Result<Vec<u8>> {
        Err(SourceError::EncryptionNotConfigured {
            path: "encrypt".to_string(),
        }
        .into())
    }

    fn encrypted_suffix(&self) -> &str {
        ""
    }
}

/// `[encryption]` section of the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Program to run, e.g. `age` or `gpg`.
    pub command: String,
    /// Arguments that make the program decrypt stdin to stdout.
    pub decrypt_args: Vec<String>,
    /// Arguments that make the program encrypt stdin to stdout.
    pub encrypt_args: Vec<String>,
    /// Suffix of encrypted source files.
    pub suffix: String,
}

/// Pipes data through an external program.
#[derive(Debug, Clone)]
pub struct CommandEncryption {
    config: EncryptionConfig,
}

impl CommandEncryption {
    /// Encryption through the configured program.
    #[must_use]
    pub const fn new(config: EncryptionConfig) -> Self {
        Self { config }
    }

    fn pipe(&self, args: &[String], input: &[u8], what: &str) -> Result<Vec<u8>> {
        let result = exec::run_with_stdin(
            Path::new(&self.config.command),
            args,
            None,
            input,
            &format!("{} {what}", self.config.command),
        )
        .with_context(|| format!("{what} with {}", self.config.command))?;
        Ok(result.stdout)
    }
}

impl Encryption for CommandEncryption {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.pipe(&self.config.decrypt_args, ciphertext, "decrypt")
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.pipe(&self.config.encrypt_args, plaintext, "encrypt")
    }

    fn encrypted_suffix(&self) -> &str {
        &self.config.suffix
    }
}

/// Encryption for `config`: [`NoEncryption`] when no command is set.
#[must_use]
pub fn from_config(config: &EncryptionConfig) -> Box<dyn Encryption> {
    if config.command.is_empty() {
        Box::new(NoEncryption)
    } else {
        Box::new(CommandEncryption::new(config.clone()))
    }
}
