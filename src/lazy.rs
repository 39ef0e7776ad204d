// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::error::{Error, Result};

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::{Arc, OnceLock},
};

type Init<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

/// Value computed on first access and cached afterwards, failures included.
///
/// Target contents are wrapped in this so that listing entries never pays
/// for template execution or decryption.
pub struct Lazy<T> {
    cell: OnceLock<Result<T, Arc<Error>>>,
    init: Option<Init<T>>,
}

impl<T> Lazy<T> {
    /// Defer computation to `init`.
    pub fn new(init: impl Fn() -> Result<T> + Send + Sync + 'static) -> Self {
        Self {
            cell: OnceLock::new(),
            init: Some(Box::new(init)),
        }
    }

    /// Already computed value.
    pub fn ready(value: T) -> Self {
        Self {
            cell: OnceLock::from(Ok(value)),
            init: None,
        }
    }

    /// Get value, computing it on first call.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Shared`] holding whatever the computation failed
    ///   with. Later calls return the same failure.
    pub fn get(&self) -> Result<&T> {
        // INVARIANT: Only pending values reach the initializer.
        let result = self.cell.get_or_init(|| match &self.init {
            Some(init) => init().map_err(Arc::new),
            None => Err(Arc::new(Error::Cancelled)),
        });

        result.as_ref().map_err(|error| Error::Shared(error.clone()))
    }

    /// Check if value was computed, successfully or not.
    pub fn is_evaluated(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T: Debug> Debug for Lazy<T> {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self.cell.get() {
            Some(Ok(value)) => fmt.debug_tuple("Lazy").field(value).finish(),
            Some(Err(error)) => fmt.debug_tuple("Lazy").field(error).finish(),
            None => fmt.write_str("Lazy(<pending>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn computes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let lazy = Lazy::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(b"contents".to_vec())
        });

        assert!(!lazy.is_evaluated());
        assert_eq!(lazy.get().unwrap(), b"contents");
        assert_eq!(lazy.get().unwrap(), b"contents");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn caches_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let lazy: Lazy<Vec<u8>> = Lazy::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::Cancelled)
        });

        assert!(matches!(lazy.get(), Err(Error::Shared(_))));
        assert!(matches!(lazy.get(), Err(Error::Shared(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ready_is_evaluated() {
        let lazy = Lazy::ready(7);
        assert!(lazy.is_evaluated());
        assert_eq!(*lazy.get().unwrap(), 7);
    }
}
