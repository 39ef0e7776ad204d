// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Externally sourced files, archives, and repositories.
//!
//! An externals manifest maps target paths to things that live outside the
//! source directory. Downloads go through a [`Fetcher`] and are cached on
//! disk keyed by the SHA-256 of their URL, so a stable network is only needed
//! when the refresh period runs out.

use crate::{
    error::{Error, Result},
    path::TargetRelPath,
    state::sha256_hex,
    system::{mkdir_all, System},
};

use flate2::read::GzDecoder;
use futures::future::BoxFuture;
use serde::{Deserialize, Deserializer};
use std::{
    collections::BTreeMap,
    io::{self, Read},
    path::{Component, Path, PathBuf},
    str::FromStr,
    time::{Duration, SystemTime},
};
use tracing::{debug, instrument};

/// Kind of external.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExternalKind {
    File,
    Archive,
    GitRepo,
}

/// Expected checksum of downloaded data.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Checksum {
    pub sha256: Option<String>,
}

/// Extra arguments for a git command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GitArgs {
    pub args: Vec<String>,
}

/// Single entry of an externals manifest.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct External {
    #[serde(rename = "type")]
    pub kind: ExternalKind,
    pub url: String,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub executable: bool,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub exact: bool,
    #[serde(default)]
    pub strip_components: usize,
    #[serde(default, deserialize_with = "deserialize_period")]
    pub refresh_period: Duration,
    #[serde(default)]
    pub checksum: Checksum,
    #[serde(default)]
    pub clone: GitArgs,
    #[serde(default)]
    pub pull: GitArgs,
}

/// Parse manifest text in format named by `ext` (`json`, `toml`, or
/// `yaml`).
///
/// # Errors
///
/// - Return [`Error::Parse`] if text does not parse.
pub(crate) fn parse_manifest(
    path: &Path,
    ext: &str,
    text: &str,
) -> Result<Vec<(String, External)>> {
    let manifest: BTreeMap<String, External> = super::parse_document(path, ext, text)?;
    Ok(manifest.into_iter().collect())
}

/// Refresh period written as a run of number and unit pairs, like `30s`,
/// `10m`, `168h`, `7d`, or `1h30m`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RefreshPeriod(pub Duration);

impl FromStr for RefreshPeriod {
    type Err = String;

    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        let text = text.trim();
        if text.is_empty() || text == "0" {
            return Ok(Self(Duration::ZERO));
        }

        let mut total = 0u64;
        let mut digits = String::new();
        for ch in text.chars() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                continue;
            }

            let unit = match ch {
                's' => 1,
                'm' => 60,
                'h' => 60 * 60,
                'd' => 24 * 60 * 60,
                _ => return Err(format!("invalid refresh period {text:?}")),
            };
            let value: u64 = digits
                .parse()
                .map_err(|_| format!("invalid refresh period {text:?}"))?;
            total += value * unit;
            digits.clear();
        }

        if !digits.is_empty() {
            return Err(format!("refresh period {text:?} is missing a unit"));
        }

        Ok(Self(Duration::from_secs(total)))
    }
}

fn deserialize_period<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Duration, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(seconds) => Ok(Duration::from_secs(seconds)),
        Raw::Text(text) => text
            .parse::<RefreshPeriod>()
            .map(|period| period.0)
            .map_err(serde::de::Error::custom),
    }
}

/// When cached downloads are refreshed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RefreshExternals {
    /// Refresh once the refresh period ran out.
    #[default]
    Auto,

    /// Always download.
    Always,

    /// Use the cache whenever it has a copy.
    Never,
}

impl FromStr for RefreshExternals {
    type Err = String;

    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        match text {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(format!("unknown refresh policy {other:?}")),
        }
    }
}

/// Download collaborator.
pub trait Fetcher: Send + Sync {
    /// Fetch body of `url`.
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// Fetch over HTTP(S).
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Construct new fetcher.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Fetch`] if TLS backend cannot be initialized.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("chezmoi/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| Error::Fetch {
                url: String::new(),
                source,
            })?;

        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let fetch_err = |source| Error::Fetch {
                url: url.to_string(),
                source,
            };
            let response = self
                .client
                .get(url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(fetch_err)?;
            let body = response.bytes().await.map_err(fetch_err)?;

            Ok(body.to_vec())
        })
    }
}

/// Download cache under a cache directory.
pub(crate) struct Cache<'a> {
    pub(crate) system: &'a dyn System,
    pub(crate) dir: PathBuf,
    pub(crate) fetcher: &'a dyn Fetcher,
    pub(crate) policy: RefreshExternals,
}

impl Cache<'_> {
    fn path(&self, url: &str) -> PathBuf {
        self.dir.join("external").join(sha256_hex(url.as_bytes()))
    }

    /// Get body of `url`, from the cache when it is fresh enough.
    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn get(&self, url: &str, refresh_period: Duration) -> Result<Vec<u8>> {
        let path = self.path(url);
        if let Some(data) = self.cached(&path, refresh_period)? {
            debug!("use cached {url}");
            return Ok(data);
        }

        debug!("fetch {url}");
        let data = self.fetcher.fetch(url).await?;
        if let Some(parent) = path.parent() {
            mkdir_all(self.system, parent, 0o700)?;
        }
        self.system.write_file(&path, &data, 0o600)?;

        Ok(data)
    }

    fn cached(&self, path: &Path, refresh_period: Duration) -> Result<Option<Vec<u8>>> {
        let info = match self.system.lstat(path) {
            Ok(info) => info,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let fresh = match self.policy {
            RefreshExternals::Always => false,
            RefreshExternals::Never => true,
            RefreshExternals::Auto => {
                refresh_period.is_zero()
                    || info
                        .modified
                        .and_then(|modified| modified.checked_add(refresh_period))
                        .is_some_and(|expires| expires > SystemTime::now())
            }
        };

        if !fresh {
            return Ok(None);
        }

        Ok(Some(self.system.read_file(path)?))
    }
}

/// Check downloaded data against the expected checksum.
///
/// # Errors
///
/// - Return [`Error::External`] on mismatch.
pub(crate) fn verify_checksum(
    target: &TargetRelPath,
    checksum: &Checksum,
    data: &[u8],
) -> Result<()> {
    let Some(expected) = &checksum.sha256 else {
        return Ok(());
    };

    let actual = sha256_hex(data);
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(Error::External {
            target: target.clone(),
            reason: format!("checksum mismatch, expected sha256 {expected}, got {actual}"),
        });
    }

    Ok(())
}

/// Kind of archive member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MemberKind {
    Dir,
    File(Vec<u8>),
    Symlink(String),
}

/// Single member of an unpacked archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ArchiveMember {
    pub(crate) path: PathBuf,
    pub(crate) mode: u32,
    pub(crate) kind: MemberKind,
}

/// Unpack a tar archive, gzip compressed or not, in memory.
///
/// The first `strip_components` leading path components of every member are
/// dropped, along with members that have nothing left.
///
/// # Errors
///
/// - Return [`io::Error`] if archive is malformed.
pub(crate) fn read_archive(data: &[u8], strip_components: usize) -> io::Result<Vec<ArchiveMember>> {
    let reader: Box<dyn Read + '_> = if data.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(data))
    } else {
        Box::new(data)
    };

    let mut archive = tar::Archive::new(reader);
    let mut members = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path: PathBuf = entry
            .path()?
            .components()
            .filter_map(|component| match component {
                Component::Normal(name) => Some(name),
                _ => None,
            })
            .skip(strip_components)
            .collect();
        if path.as_os_str().is_empty() {
            continue;
        }

        let mode = entry.header().mode().unwrap_or(0o644);
        let kind = match entry.header().entry_type() {
            tar::EntryType::Directory => MemberKind::Dir,
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents)?;
                MemberKind::File(contents)
            }
            tar::EntryType::Symlink => {
                let linkname = entry
                    .link_name()?
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                MemberKind::Symlink(linkname)
            }
            other => {
                debug!("skip archive member {:?} of type {other:?}", path);
                continue;
            }
        };

        members.push(ArchiveMember { path, mode, kind });
    }

    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::RealSystem;
    use futures::FutureExt;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    impl Fetcher for CountingFetcher {
        fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(format!("{url} #{call}").into_bytes()) }.boxed()
        }
    }

    #[rstest]
    #[case("0", 0)]
    #[case("30s", 30)]
    #[case("10m", 600)]
    #[case("168h", 604_800)]
    #[case("7d", 604_800)]
    #[case("1h30m", 5_400)]
    fn parse_refresh_period(#[case] text: &str, #[case] seconds: u64) {
        assert_eq!(
            text.parse::<RefreshPeriod>(),
            Ok(RefreshPeriod(Duration::from_secs(seconds)))
        );
    }

    #[rstest]
    #[case("10")]
    #[case("5w")]
    #[case("h")]
    fn reject_refresh_period(#[case] text: &str) {
        assert!(text.parse::<RefreshPeriod>().is_err());
    }

    #[test]
    fn manifest_formats() {
        let toml = indoc! {r#"
            [".oh-my-zsh"]
            type = "archive"
            url = "https://example.com/ohmyzsh.tar.gz"
            exact = true
            stripComponents = 1
            refreshPeriod = "168h"

            [".vim/autoload/plug.vim"]
            type = "file"
            url = "https://example.com/plug.vim"
            checksum.sha256 = "abc"
        "#};
        let externals = parse_manifest(Path::new(".chezmoiexternal.toml"), "toml", toml).unwrap();
        assert_eq!(externals.len(), 2);
        let (target, archive) = &externals[0];
        assert_eq!(target, ".oh-my-zsh");
        assert_eq!(archive.kind, ExternalKind::Archive);
        assert_eq!(archive.strip_components, 1);
        assert_eq!(archive.refresh_period, Duration::from_secs(604_800));
        assert!(archive.exact);
        assert_eq!(externals[1].1.checksum.sha256.as_deref(), Some("abc"));

        let yaml = indoc! {"
            .local/share/repo:
              type: git-repo
              url: https://example.com/repo.git
              clone:
                args: [--depth, '1']
        "};
        let externals = parse_manifest(Path::new("x.yaml"), "yaml", yaml).unwrap();
        assert_eq!(externals[0].1.kind, ExternalKind::GitRepo);
        assert_eq!(externals[0].1.clone.args, vec!["--depth", "1"]);

        let json = r#"{"x": {"type": "nope", "url": "u"}}"#;
        assert!(matches!(
            parse_manifest(Path::new("x.json"), "json", json),
            Err(Error::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn cache_honors_policy() {
        let temp = TempDir::new().unwrap();
        let system = RealSystem::new();
        let fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
        };
        let cache = |policy| Cache {
            system: &system,
            dir: temp.path().to_path_buf(),
            fetcher: &fetcher,
            policy,
        };
        let url = "https://example.com/a";
        let day = Duration::from_secs(86_400);

        assert_eq!(cache(RefreshExternals::Auto).get(url, day).await.unwrap(), b"https://example.com/a #0");
        assert_eq!(cache(RefreshExternals::Auto).get(url, day).await.unwrap(), b"https://example.com/a #0");
        assert_eq!(cache(RefreshExternals::Never).get(url, day).await.unwrap(), b"https://example.com/a #0");
        assert_eq!(cache(RefreshExternals::Always).get(url, day).await.unwrap(), b"https://example.com/a #1");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let path = temp.path().join("external").join(sha256_hex(url.as_bytes()));
            let mode = std::fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn checksum_mismatch_is_error() {
        let target = TargetRelPath::from("x");
        let good = Checksum {
            sha256: Some(sha256_hex(b"data").to_uppercase()),
        };
        verify_checksum(&target, &good, b"data").unwrap();
        verify_checksum(&target, &Checksum::default(), b"data").unwrap();
        assert!(verify_checksum(&target, &good, b"other").is_err());
    }

    fn tarball(gzip: bool) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut add = |path: &str, kind: tar::EntryType, mode: u32, data: &[u8], link: Option<&str>| {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(kind);
            header.set_mode(mode);
            header.set_size(data.len() as u64);
            if let Some(link) = link {
                header.set_link_name(link).unwrap();
            }
            builder.append_data(&mut header, path, data).unwrap();
        };
        add("top/", tar::EntryType::Directory, 0o755, b"", None);
        add("top/bin/", tar::EntryType::Directory, 0o755, b"", None);
        add("top/bin/tool", tar::EntryType::Regular, 0o755, b"#!/bin/sh\n", None);
        add("top/README", tar::EntryType::Regular, 0o644, b"hi\n", None);
        add("top/link", tar::EntryType::Symlink, 0o777, b"", Some("README"));
        let data = builder.into_inner().unwrap();

        if !gzip {
            return data;
        }
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        std::io::Write::write_all(&mut encoder, &data).unwrap();
        encoder.finish().unwrap()
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn archive_strips_components(#[case] gzip: bool) {
        let members = read_archive(&tarball(gzip), 1).unwrap();
        assert_eq!(
            members,
            vec![
                ArchiveMember {
                    path: PathBuf::from("bin"),
                    mode: 0o755,
                    kind: MemberKind::Dir
                },
                ArchiveMember {
                    path: PathBuf::from("bin/tool"),
                    mode: 0o755,
                    kind: MemberKind::File(b"#!/bin/sh\n".to_vec())
                },
                ArchiveMember {
                    path: PathBuf::from("README"),
                    mode: 0o644,
                    kind: MemberKind::File(b"hi\n".to_vec())
                },
                ArchiveMember {
                    path: PathBuf::from("link"),
                    mode: 0o777,
                    kind: MemberKind::Symlink("README".into())
                },
            ]
        );
    }
}
