//! Compute-once values for file contents and symlink targets.
//!
//! Templating, decrypting and reading are deferred until a caller actually
//! needs the bytes; many operations only need metadata. A [`Lazy`] holds
//! either a pending closure or its memoized result (value or error), and is
//! safe to share between walker threads.
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use anyhow::Result;

use crate::digest::{Sha256Sum, sha256_sum};

type Init<T> = Box<dyn FnOnce() -> Result<T> + Send>;

/// A memoized error that can be handed out more than once.
#[derive(Debug, Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for SharedError {}

impl SharedError {
    /// The original error.
    #[must_use]
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

/// A value computed on first access and memoized, including failures.
pub struct Lazy<T> {
    cell: OnceLock<std::result::Result<T, SharedError>>,
    init: Mutex<Option<Init<T>>>,
}

impl<T> Lazy<T> {
    /// A lazy value computed by `f` on first access.
    pub fn new(f: impl FnOnce() -> Result<T> + Send + 'static) -> Self {
        Self {
            cell: OnceLock::new(),
            init: Mutex::new(Some(Box::new(f))),
        }
    }

    /// An already-evaluated value.
    pub fn ready(value: T) -> Self {
        Self {
            cell: OnceLock::from(Ok(value)),
            init: Mutex::new(None),
        }
    }

    /// Evaluate (at most once) and return the value.
    ///
    /// # Errors
    ///
    /// Returns the memoized error if evaluation failed.
    pub fn get(&self) -> Result<&T> {
        self.cell
            .get_or_init(|| {
                let init = self
                    .init
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match init {
                    Some(f) => f().map_err(|e| SharedError(Arc::new(e))),
                    None => Err(SharedError(Arc::new(anyhow::anyhow!(
                        "lazy value has no initialiser"
                    )))),
                }
            })
            .as_ref()
            .map_err(|e| anyhow::Error::new(e.clone()))
    }

    /// Whether the value has been evaluated.
    pub fn is_evaluated(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T: fmt::Debug> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell.get() {
            Some(Ok(value)) => f.debug_tuple("Lazy").field(value).finish(),
            Some(Err(e)) => f.debug_tuple("Lazy").field(&format!("error: {e}")).finish(),
            None => f.write_str("Lazy(<pending>)"),
        }
    }
}

/// Lazily evaluated file contents with a memoized digest.
#[derive(Debug)]
pub struct LazyContents {
    contents: Lazy<Vec<u8>>,
    sha256: OnceLock<Sha256Sum>,
}

impl LazyContents {
    /// Contents produced by `f` on first access.
    pub fn new(f: impl FnOnce() -> Result<Vec<u8>> + Send + 'static) -> Self {
        Self {
            contents: Lazy::new(f),
            sha256: OnceLock::new(),
        }
    }

    /// Contents known up front.
    #[must_use]
    pub fn ready(contents: Vec<u8>) -> Self {
        Self {
            contents: Lazy::ready(contents),
            sha256: OnceLock::new(),
        }
    }

    /// The contents.
    ///
    /// # Errors
    ///
    /// Returns the evaluation error, e.g. a template or decryption failure.
    pub fn contents(&self) -> Result<&[u8]> {
        self.contents.get().map(Vec::as_slice)
    }

    /// SHA-256 of the contents.
    ///
    /// # Errors
    ///
    /// Returns the evaluation error.
    pub fn sha256(&self) -> Result<Sha256Sum> {
        if let Some(sum) = self.sha256.get() {
            return Ok(*sum);
        }
        let sum = sha256_sum(self.contents()?);
        Ok(*self.sha256.get_or_init(|| sum))
    }
}

/// Lazily evaluated symlink target with a memoized digest.
#[derive(Debug)]
pub struct LazyLinkname {
    linkname: Lazy<String>,
    sha256: OnceLock<Sha256Sum>,
}

impl LazyLinkname {
    /// Linkname produced by `f` on first access.
    pub fn new(f: impl FnOnce() -> Result<String> + Send + 'static) -> Self {
        Self {
            linkname: Lazy::new(f),
            sha256: OnceLock::new(),
        }
    }

    /// Linkname known up front.
    #[must_use]
    pub fn ready(linkname: String) -> Self {
        Self {
            linkname: Lazy::ready(linkname),
            sha256: OnceLock::new(),
        }
    }

    /// The linkname.
    ///
    /// # Errors
    ///
    /// Returns the evaluation error.
    pub fn linkname(&self) -> Result<&str> {
        self.linkname.get().map(String::as_str)
    }

    /// SHA-256 of the linkname.
    ///
    /// # Errors
    ///
    /// Returns the evaluation error.
    pub fn sha256(&self) -> Result<Sha256Sum> {
        if let Some(sum) = self.sha256.get() {
            return Ok(*sum);
        }
        let sum = sha256_sum(self.linkname()?.as_bytes());
        Ok(*self.sha256.get_or_init(|| sum))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn evaluates_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let lazy = Lazy::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        });
        assert!(!lazy.is_evaluated());
        assert_eq!(*lazy.get().unwrap(), 42);
        assert_eq!(*lazy.get().unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn memoizes_errors() {
        let lazy: Lazy<u8> = Lazy::new(|| Err(anyhow::anyhow!("template failed")));
        let first = lazy.get().unwrap_err().to_string();
        let second = lazy.get().unwrap_err().to_string();
        assert_eq!(first, "template failed");
        assert_eq!(first, second);
    }

    #[test]
    fn contents_digest_matches() {
        let c = LazyContents::new(|| Ok(b"hello".to_vec()));
        assert_eq!(c.contents().unwrap(), b"hello");
        assert_eq!(c.sha256().unwrap(), sha256_sum(b"hello"));
    }

    #[test]
    fn linkname_digest_matches() {
        let l = LazyLinkname::ready("target".to_string());
        assert_eq!(l.sha256().unwrap(), sha256_sum(b"target"));
    }

    #[test]
    fn shared_across_threads() {
        let c = Arc::new(LazyContents::new(|| Ok(vec![1, 2, 3])));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || c.sha256().unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), sha256_sum(&[1, 2, 3]));
        }
    }
}
