// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the configuration file to simplify serialization
//! and deserialization. File I/O is left to the caller to figure out.
//!
//! A [`Config`] is what the user wrote. A [`Context`] is what a single
//! invocation runs with: every directory resolved, command line overrides
//! applied, and collaborators built. It is never changed after construction.

use crate::{
    encryption::{CommandEncryption, Encryption, NoEncryption},
    path::{default_cache_dir, default_source_dir, home_dir, NoWayHome},
    state::{get_json, set_json, sha256_hex, Bucket, ConfigState, PersistentState},
    system::{Interpreter, System},
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

/// Name of the config template in the root of the source directory.
pub const CONFIG_TEMPLATE: &str = ".chezmoi.toml.tmpl";

const CONFIG_STATE_KEY: &[u8] = b"configState";

/// Configuration file layout.
///
/// # General Layout
///
/// Every field is optional. Directories fall back to XDG defaults, the umask
/// to the one of the running process, and encryption to none at all. The
/// `[data]` table is merged over template data found in the source
/// directory.
#[derive(Default, Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Where the source state lives.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_dir: Option<PathBuf>,

    /// Where the source state is applied to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub umask: Option<u32>,

    /// Which encryption tool to use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionKind>,

    pub age: AgeConfig,

    pub gpg: GpgConfig,

    pub diff: DiffConfig,

    /// Script interpreters keyed by file extension.
    pub interpreters: BTreeMap<String, InterpreterConfig>,

    /// Where scripts are written before they run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_temp_dir: Option<PathBuf>,

    /// Template data with priority over data files.
    pub data: toml::Table,
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Config = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        config.source_dir = config.source_dir.map(expand).transpose()?;
        config.dest_dir = config.dest_dir.map(expand).transpose()?;
        config.script_temp_dir = config.script_temp_dir.map(expand).transpose()?;
        config.age.identity = config.age.identity.map(expand).transpose()?;

        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand(path: PathBuf) -> Result<PathBuf, ConfigError> {
    let expanded = shellexpand::full(path.to_string_lossy().as_ref())
        .map_err(ConfigError::ShellExpansion)?
        .into_owned();
    Ok(PathBuf::from(expanded))
}

/// Supported encryption tools.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionKind {
    Age,
    Gpg,
}

/// Settings of the `age` tool.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<PathBuf>,
    pub recipients: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

/// Settings of the `gpg` tool.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GpgConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

/// Settings of the `diff` command.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiffConfig {
    /// External diff program. The builtin git-style diff is used without it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    pub args: Vec<String>,

    /// Entry types left out of diffs, like `scripts`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
}

/// Program running scripts of one extension.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InterpreterConfig {
    pub command: String,
    pub args: Vec<String>,
}

/// Settings given on the command line that beat the configuration file.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Overrides {
    pub source_dir: Option<PathBuf>,
    pub dest_dir: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
}

/// Resolved settings of one invocation.
pub struct Context {
    source_dir: PathBuf,
    dest_dir: PathBuf,
    config_file: PathBuf,
    state_file: PathBuf,
    cache_dir: PathBuf,
    umask: u32,
    encryption: Arc<dyn Encryption>,
    interpreters: BTreeMap<String, Interpreter>,
    script_temp_dir: Option<PathBuf>,
    data: serde_json::Value,
    diff: DiffConfig,
}

impl Context {
    /// Resolve `config` against `overrides` and the user's environment.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::NoWayHome`] if a default directory cannot be
    ///   determined.
    /// - Return [`ConfigError::Data`] if the `[data]` table cannot become
    ///   template data.
    pub fn new(config: &Config, overrides: &Overrides, config_file: &Path) -> Result<Self, ConfigError> {
        let source_dir = match overrides.source_dir.clone().or_else(|| config.source_dir.clone()) {
            Some(dir) => dir,
            None => default_source_dir()?,
        };
        let dest_dir = match overrides.dest_dir.clone().or_else(|| config.dest_dir.clone()) {
            Some(dir) => dir,
            None => home_dir()?,
        };
        let config_file = overrides
            .config_file
            .clone()
            .unwrap_or_else(|| config_file.to_path_buf());
        let state_file = config_file
            .parent()
            .unwrap_or(Path::new("."))
            .join("chezmoistate.boltdb");

        let encryption: Arc<dyn Encryption> = match config.encryption {
            None => Arc::new(NoEncryption),
            Some(EncryptionKind::Age) => Arc::new(CommandEncryption::age(
                config.age.identity.clone(),
                &config.age.recipients,
                config.age.suffix.clone(),
            )),
            Some(EncryptionKind::Gpg) => Arc::new(CommandEncryption::gpg(
                config.gpg.recipient.clone(),
                &config.gpg.args,
                config.gpg.suffix.clone(),
            )),
        };

        let interpreters = config
            .interpreters
            .iter()
            .map(|(ext, interpreter)| {
                let interpreter = Interpreter {
                    command: interpreter.command.clone(),
                    args: interpreter.args.clone(),
                };
                (ext.trim_start_matches('.').to_string(), interpreter)
            })
            .collect();

        let data = serde_json::to_value(&config.data).map_err(ConfigError::Data)?;

        Ok(Self {
            source_dir,
            dest_dir,
            config_file,
            state_file,
            cache_dir: default_cache_dir()?,
            umask: config.umask.unwrap_or_else(process_umask),
            encryption,
            interpreters,
            script_temp_dir: config.script_temp_dir.clone(),
            data,
            diff: config.diff.clone(),
        })
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn umask(&self) -> u32 {
        self.umask
    }

    pub fn encryption(&self) -> Arc<dyn Encryption> {
        self.encryption.clone()
    }

    pub fn interpreters(&self) -> &BTreeMap<String, Interpreter> {
        &self.interpreters
    }

    pub fn script_temp_dir(&self) -> Option<&Path> {
        self.script_temp_dir.as_deref()
    }

    /// Template data with priority over data files.
    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn diff(&self) -> &DiffConfig {
        &self.diff
    }

    /// Check if the config template changed since it was last recorded.
    ///
    /// The first time a template is seen its hash is only recorded.
    ///
    /// # Errors
    ///
    /// - Return [`crate::error::Error`] if the template or the persistent
    ///   state cannot be read or written.
    pub fn config_template_changed(
        &self,
        system: &dyn System,
        state: &dyn PersistentState,
    ) -> crate::error::Result<bool> {
        let path = self.source_dir.join(CONFIG_TEMPLATE);
        let contents = match system.read_file(&path) {
            Ok(contents) => contents,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        let hash = sha256_hex(&contents);
        let last: Option<ConfigState> = get_json(state, Bucket::ConfigState, CONFIG_STATE_KEY)?;
        match last {
            Some(last) => Ok(last.config_template_contents_sha256 != hash),
            None => {
                record_config_template(state, hash)?;
                Ok(false)
            }
        }
    }
}

fn record_config_template(state: &dyn PersistentState, hash: String) -> crate::error::Result<()> {
    let value = ConfigState {
        config_template_contents_sha256: hash,
    };
    set_json(state, Bucket::ConfigState, CONFIG_STATE_KEY, &value).map_err(Into::into)
}

#[cfg(unix)]
fn process_umask() -> u32 {
    use nix::sys::stat::{umask, Mode};

    // INVARIANT: umask can only be read by setting it, so restore it at once.
    let old = umask(Mode::empty());
    umask(old);
    old.bits() as u32
}

#[cfg(not(unix))]
fn process_umask() -> u32 {
    0o022
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Data table cannot be turned into template data.
    #[error("invalid template data in configuration")]
    Data(#[source] serde_json::Error),

    #[error(transparent)]
    NoWayHome(#[from] NoWayHome),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{state::MemoryState, system::RealSystem};
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn parse_full_config() {
        let config: Config = indoc! {r#"
            sourceDir = "/src"
            umask = 0o077
            encryption = "age"

            [age]
            identity = "/keys/me.txt"
            recipients = ["age1xyz"]

            [diff]
            command = "delta"
            exclude = "scripts"

            [interpreters.py]
            command = "python3"

            [data]
            email = "me@example.com"
        "#}
        .parse()
        .unwrap();

        assert_eq!(config.source_dir, Some(PathBuf::from("/src")));
        assert_eq!(config.umask, Some(0o077));
        assert_eq!(config.encryption, Some(EncryptionKind::Age));
        assert_eq!(config.age.recipients, vec!["age1xyz".to_string()]);
        assert_eq!(config.diff.command.as_deref(), Some("delta"));
        assert_eq!(config.interpreters["py"].command, "python3");
        assert_eq!(config.data["email"].as_str(), Some("me@example.com"));
    }

    #[test]
    fn display_round_trips() {
        let config: Config = "destDir = \"/home/ferris\"\n".parse().unwrap();
        let again: Config = config.to_string().parse().unwrap();
        assert_eq!(config, again);
    }

    #[test]
    fn context_prefers_overrides() {
        let config: Config = "sourceDir = \"/from/config\"\ndestDir = \"/home\"\numask = 18\n"
            .parse()
            .unwrap();
        let overrides = Overrides {
            source_dir: Some(PathBuf::from("/from/flag")),
            ..Default::default()
        };

        let ctx = Context::new(&config, &overrides, Path::new("/cfg/chezmoi.toml")).unwrap();
        assert_eq!(ctx.source_dir(), Path::new("/from/flag"));
        assert_eq!(ctx.dest_dir(), Path::new("/home"));
        assert_eq!(ctx.state_file(), Path::new("/cfg/chezmoistate.boltdb"));
        assert_eq!(ctx.umask(), 0o022);
    }

    #[test]
    fn config_template_change_is_noticed() {
        let temp = TempDir::new().unwrap();
        let config = Config {
            source_dir: Some(temp.path().to_path_buf()),
            dest_dir: Some(temp.path().to_path_buf()),
            ..Default::default()
        };
        let ctx = Context::new(&config, &Overrides::default(), Path::new("/cfg/chezmoi.toml")).unwrap();
        let system = RealSystem::new();
        let state = MemoryState::new();

        assert!(!ctx.config_template_changed(&system, &state).unwrap());
        std::fs::write(temp.path().join(CONFIG_TEMPLATE), "a").unwrap();
        assert!(!ctx.config_template_changed(&system, &state).unwrap());
        std::fs::write(temp.path().join(CONFIG_TEMPLATE), "b").unwrap();
        assert!(ctx.config_template_changed(&system, &state).unwrap());
    }
}
