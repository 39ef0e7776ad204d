// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Engine error types.
//!
//! Leaf modules carry their own error enums. This one ties them together for
//! everything that reads the source state, builds target state, and applies
//! it.
//!
//! Errors fall into a handful of classes that callers treat differently:
//!
//! - Parse errors ([`Error::InvalidSourceName`], [`Error::InconsistentState`])
//!   are always fatal and name the offending source path.
//! - I/O errors ([`Error::System`]) can be classified further through
//!   [`crate::system::Error::class`].
//! - Template and decryption errors are wrapped with the source path.
//! - Per-path failures during apply are wrapped in [`Error::Target`] so the
//!   destination path is part of the message.
//! - [`Error::TooOld`] is raised before any other work when the source
//!   state wants a newer engine.

use crate::{
    attr::InvalidAttributesError, encryption, path::TargetRelPath, state, system, template,
};

use std::{
    error::Error as StdError,
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
    sync::Arc,
};

/// Engine error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Source name carries undecodable attributes.
    #[error("invalid source name {:?}", path.display())]
    InvalidSourceName {
        path: PathBuf,
        #[source]
        source: InvalidAttributesError,
    },

    /// Several source entries claim the same target.
    #[error("inconsistent state for {target}: {}", origins.join(", "))]
    InconsistentState {
        target: TargetRelPath,
        origins: Vec<String>,
    },

    /// Source state wants a newer engine.
    #[error("source state requires version {need} or later, chezmoi is version {have}")]
    TooOld {
        have: semver::Version,
        need: semver::Version,
    },

    /// Version file does not hold a version.
    #[error("invalid version in {:?}", path.display())]
    InvalidVersion {
        path: PathBuf,
        #[source]
        source: semver::Error,
    },

    /// Non-script found where only scripts are allowed.
    #[error("{:?} is not a script", path.display())]
    NotAScript { path: PathBuf },

    /// Source entry is neither file, directory, nor symlink.
    #[error("unsupported file type {:?}", path.display())]
    UnsupportedFileType { path: PathBuf },

    /// Template failed to execute.
    #[error("failed to execute template {:?}", path.display())]
    Template {
        path: PathBuf,
        #[source]
        source: template::Error,
    },

    /// Encrypted contents failed to decrypt or encrypt.
    #[error("failed to process encrypted file {:?}", path.display())]
    Encryption {
        path: PathBuf,
        #[source]
        source: encryption::Error,
    },

    /// Data or externals file cannot be parsed.
    #[error("failed to parse {:?}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// Ignore pattern is malformed.
    #[error("invalid ignore pattern in {:?}", path.display())]
    Pattern {
        path: PathBuf,
        #[source]
        source: ignore::Error,
    },

    /// Remove pattern is malformed.
    #[error("invalid remove pattern {pattern:?}")]
    Glob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// Path should be a directory but is something else.
    #[error("{:?} is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    /// Destination changed since it was last written and nobody could be
    /// asked what to do.
    #[error("{0} has changed since chezmoi last wrote it")]
    Conflict(TargetRelPath),

    /// Target is not managed.
    #[error("{0}: not in source state")]
    NotInSourceState(TargetRelPath),

    /// External download failed.
    #[error("failed to fetch {url}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// External is misconfigured or its payload is unusable.
    #[error("external {target}: {reason}")]
    External { target: TargetRelPath, reason: String },

    /// Path cannot be added to the source state.
    #[error("cannot add {:?}: {reason}", path.display())]
    Add { path: PathBuf, reason: String },

    /// Interactive prompt failed.
    #[error("failed to prompt for {target}")]
    Prompt {
        target: TargetRelPath,
        #[source]
        source: inquire::InquireError,
    },

    /// Operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Failure of a cached computation.
    #[error(transparent)]
    Shared(Arc<Error>),

    /// Failure while updating one target.
    #[error("failed to update {target}")]
    Target {
        target: TargetRelPath,
        #[source]
        source: Box<Error>,
    },

    /// Some targets failed while the run kept going.
    #[error("{0} target(s) failed")]
    KeptGoing(usize),

    #[error(transparent)]
    System(#[from] system::Error),

    #[error(transparent)]
    State(#[from] state::Error),
}

impl Error {
    pub(crate) fn target(target: &TargetRelPath) -> impl FnOnce(Error) -> Self + '_ {
        move |error| match error {
            error @ Self::Target { .. } => error,
            error => Self::Target {
                target: target.clone(),
                source: Box::new(error),
            },
        }
    }

    pub(crate) fn parse(
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(Box<dyn StdError + Send + Sync>) -> Self {
        let path = path.into();
        move |source| Self::Parse { path, source }
    }
}

/// Display an error followed by every error that caused it.
pub struct Chain<'a>(pub &'a (dyn StdError + 'static));

impl Display for Chain<'_> {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(error) = source {
            write!(fmt, ": {error}")?;
            source = error.source();
        }
        Ok(())
    }
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{io, path::Path};

    #[test]
    fn chain_walks_sources() {
        let error = Error::target(&TargetRelPath::from(".bashrc"))(Error::System(
            system::Error::io("write", Path::new("/home/user/.bashrc"))(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "denied",
            )),
        ));
        assert_eq!(
            Chain(&error).to_string(),
            r#"failed to update .bashrc: failed to write "/home/user/.bashrc": denied"#
        );
    }

    #[test]
    fn target_wraps_once() {
        let target = TargetRelPath::from("a");
        let error = Error::target(&target)(Error::target(&target)(Error::Cancelled));
        assert_eq!(Chain(&error).to_string(), "failed to update a: operation cancelled");
    }
}
