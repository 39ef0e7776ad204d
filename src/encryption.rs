// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Encryption collaborators.
//!
//! Chezmoi never implements cryptography itself. Encrypted source files are
//! handed to an external program through [`Encryption`], which is either a
//! [`CommandEncryption`] driving `age` or `gpg`, or [`NoEncryption`] when the
//! user did not configure any.

use std::{
    ffi::OsString,
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    thread,
};
use tracing::debug;

/// Encrypt and decrypt file contents.
pub trait Encryption: Send + Sync {
    /// Decrypt ciphertext.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Encrypt plaintext.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt ciphertext into file at `path`.
    fn decrypt_to_file(&self, path: &Path, ciphertext: &[u8]) -> Result<()> {
        let plaintext = self.decrypt(ciphertext)?;
        fs::write(path, plaintext).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Encrypt contents of file at `path`.
    fn encrypt_file(&self, path: &Path) -> Result<Vec<u8>> {
        let plaintext = fs::read(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.encrypt(&plaintext)
    }

    /// Suffix appended to encrypted source file names.
    fn encrypted_suffix(&self) -> &str;
}

/// No encryption configured. Every operation fails.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoEncryption;

impl Encryption for NoEncryption {
    fn decrypt(&self, _: &[u8]) -> Result<Vec<u8>> {
        Err(Error::NotConfigured)
    }

    fn encrypt(&self, _: &[u8]) -> Result<Vec<u8>> {
        Err(Error::NotConfigured)
    }

    fn encrypted_suffix(&self) -> &str {
        ""
    }
}

/// Encryption through an external program that filters stdin to stdout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandEncryption {
    command: String,
    decrypt_args: Vec<OsString>,
    encrypt_args: Vec<OsString>,
    suffix: String,
}

impl CommandEncryption {
    /// Construct new command encryption.
    pub fn new(
        command: impl Into<String>,
        decrypt_args: impl IntoIterator<Item = impl Into<OsString>>,
        encrypt_args: impl IntoIterator<Item = impl Into<OsString>>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            decrypt_args: decrypt_args.into_iter().map(Into::into).collect(),
            encrypt_args: encrypt_args.into_iter().map(Into::into).collect(),
            suffix: suffix.into(),
        }
    }

    /// Drive `age` with an identity file and a set of recipients.
    pub fn age(identity: Option<PathBuf>, recipients: &[String], suffix: Option<String>) -> Self {
        let mut decrypt_args: Vec<OsString> = vec!["--decrypt".into()];
        if let Some(identity) = identity {
            decrypt_args.push("--identity".into());
            decrypt_args.push(identity.into_os_string());
        }

        let mut encrypt_args: Vec<OsString> = vec!["--encrypt".into(), "--armor".into()];
        for recipient in recipients {
            encrypt_args.push("--recipient".into());
            encrypt_args.push(recipient.into());
        }

        Self::new(
            "age",
            decrypt_args,
            encrypt_args,
            suffix.unwrap_or_else(|| ".age".into()),
        )
    }

    /// Drive `gpg` for a single recipient, or symmetric encryption without
    /// one.
    pub fn gpg(recipient: Option<String>, args: &[String], suffix: Option<String>) -> Self {
        let mut decrypt_args: Vec<OsString> = vec!["--armor".into(), "--decrypt".into()];
        decrypt_args.extend(args.iter().map(OsString::from));

        let mut encrypt_args: Vec<OsString> = vec!["--armor".into()];
        match recipient {
            Some(recipient) => {
                encrypt_args.push("--recipient".into());
                encrypt_args.push(recipient.into());
                encrypt_args.push("--encrypt".into());
            }
            None => encrypt_args.push("--symmetric".into()),
        }
        encrypt_args.extend(args.iter().map(OsString::from));

        Self::new(
            "gpg",
            decrypt_args,
            encrypt_args,
            suffix.unwrap_or_else(|| ".asc".into()),
        )
    }

    fn filter(&self, args: &[OsString], input: &[u8]) -> Result<Vec<u8>> {
        debug!("run {} {:?}", self.command, args);
        let mut child = Command::new(&self.command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn {
                command: self.command.clone(),
                source,
            })?;

        // INVARIANT: Feed stdin from another thread so a chatty child cannot
        // deadlock on a full stdout pipe.
        let stdin = child.stdin.take();
        let output = thread::scope(|scope| {
            scope.spawn(move || {
                if let Some(mut stdin) = stdin {
                    let _ = stdin.write_all(input);
                }
            });
            child.wait_with_output()
        })
        .map_err(|source| Error::Spawn {
            command: self.command.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(Error::Failed {
                command: self.command.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            });
        }

        Ok(output.stdout)
    }
}

impl Encryption for CommandEncryption {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.filter(&self.decrypt_args, ciphertext)
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.filter(&self.encrypt_args, plaintext)
    }

    fn encrypted_suffix(&self) -> &str {
        &self.suffix
    }
}

/// Encryption error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Encrypted file found but no encryption configured.
    #[error("no encryption configured")]
    NotConfigured,

    /// Encryption program cannot be started.
    #[error("failed to run {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Encryption program ran but did not succeed.
    #[error("{command} failed: {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    /// Plaintext file cannot be read or written.
    #[error("failed to access {:?}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn no_encryption_refuses() {
        assert!(matches!(NoEncryption.decrypt(b"x"), Err(Error::NotConfigured)));
        assert_eq!(NoEncryption.encrypted_suffix(), "");
    }

    #[test]
    fn age_arguments() {
        let age = CommandEncryption::age(
            Some(PathBuf::from("/key.txt")),
            &["age1abc".into()],
            None,
        );
        assert_eq!(
            age,
            CommandEncryption::new(
                "age",
                ["--decrypt", "--identity", "/key.txt"],
                ["--encrypt", "--armor", "--recipient", "age1abc"],
                ".age"
            )
        );
    }

    #[cfg(unix)]
    #[test]
    fn filters_through_command() {
        let rot = CommandEncryption::new("tr", ["b-za", "a-z"], ["a-z", "b-za"], ".rot");
        let ciphertext = rot.encrypt(b"hello\n").unwrap();
        assert_eq!(ciphertext, b"ifmmp\n");
        assert_eq!(rot.decrypt(&ciphertext).unwrap(), b"hello\n");

        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("plain");
        rot.decrypt_to_file(&path, b"ifmmp\n").unwrap();
        assert_eq!(rot.encrypt_file(&path).unwrap(), b"ifmmp\n");
    }

    #[cfg(unix)]
    #[test]
    fn reports_failure() {
        let broken = CommandEncryption::new("false", Vec::<String>::new(), Vec::<String>::new(), "");
        assert!(matches!(broken.decrypt(b"x"), Err(Error::Failed { .. })));
    }
}
