// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Source state.
//!
//! The source directory describes the desired destination through file
//! names. Reading it happens in two passes. The first pass gathers
//! everything templates may need: version requirements, data documents, and
//! shared snippets under `.chezmoitemplates`. The second pass turns every
//! name into a [`SourceStateEntry`] keyed by its target path, honoring
//! `.chezmoiignore`, `.chezmoiremove`, `.chezmoiscripts`, and externals
//! manifests along the way.
//!
//! Every entry keeps its contents lazy, so a template is only rendered and a
//! file only decrypted once something actually needs it.
//!
//! # See Also
//!
//! - [`crate::attr`] for how names map to attributes.
//! - [`crate::target`] for what entries turn into.

mod add;
mod entry;
mod externals;
mod patterns;

pub use add::AddOptions;
pub use entry::{Origin, SourceCommand, SourceDir, SourceFile, SourceRemove, SourceStateEntry};
pub use externals::{
    Checksum, External, ExternalKind, Fetcher, GitArgs, HttpFetcher, RefreshExternals,
    RefreshPeriod,
};
pub use patterns::PatternSet;

use crate::{
    attr::{DirAttr, FileAttr, ScriptOrder, SourceFileKind, TEMPLATE_SUFFIX},
    encryption::{Encryption, NoEncryption},
    error::{Error, Result},
    lazy::Lazy,
    path::{home_dir, SourceRelPath, TargetRelPath},
    system::{DirEntry, FileKind, Interpreter, RunScriptOptions, System},
    target::{Contents, DirCommand},
    template::{include_func, output_func, FuncMap, TemplateEngine, TemplateOptions},
};

use externals::{parse_manifest, read_archive, verify_checksum, Cache, MemberKind};
use futures::{stream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    env,
    ffi::OsStr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const ROOT_FILE: &str = ".chezmoiroot";
const IGNORE_FILE: &str = ".chezmoiignore";
const REMOVE_FILE: &str = ".chezmoiremove";
const VERSION_FILE: &str = ".chezmoiversion";
const DATA_NAME: &str = ".chezmoidata";
const TEMPLATES_DIR: &str = ".chezmoitemplates";
const SCRIPTS_DIR: &str = ".chezmoiscripts";
const EXTERNAL_PREFIX: &str = ".chezmoiexternal.";

const MAX_CONCURRENT_FETCHES: usize = 8;

/// Knobs of a single read.
#[derive(Clone, Debug, Default)]
pub struct ReadOptions {
    pub refresh_externals: RefreshExternals,
}

/// Everything lazy contents need once reading is done.
pub(crate) struct SourceContext {
    pub(crate) system: Arc<dyn System>,
    pub(crate) source_dir: PathBuf,
    pub(crate) dest_dir: PathBuf,
    pub(crate) encryption: Arc<dyn Encryption>,
    pub(crate) engine: TemplateEngine,
    pub(crate) data: Value,
    pub(crate) interpreters: BTreeMap<String, Interpreter>,
    pub(crate) script_env: Vec<(String, String)>,
    pub(crate) script_temp_dir: Option<PathBuf>,
}

impl SourceContext {
    /// Render template `source` named `name`, exposing the target path and
    /// optional standard input under `chezmoi`.
    pub(crate) fn execute_with(
        &self,
        name: &str,
        target: Option<&TargetRelPath>,
        source: &[u8],
        stdin: Option<String>,
    ) -> Result<Vec<u8>> {
        let mut data = self.data.clone();
        if let Some(chezmoi) = data.get_mut("chezmoi").and_then(Value::as_object_mut) {
            chezmoi.insert("sourceFile".into(), Value::from(name));
            if let Some(target) = target {
                let target = target.to_abs(&self.dest_dir);
                chezmoi.insert(
                    "targetFile".into(),
                    Value::from(target.to_string_lossy().into_owned()),
                );
            }
            if let Some(stdin) = stdin {
                chezmoi.insert("stdin".into(), Value::from(stdin));
            }
        }

        self.engine
            .execute(name, source, &data)
            .map_err(|source| Error::Template {
                path: self.source_dir.join(name),
                source,
            })
    }

    pub(crate) fn execute(&self, name: &str, target: &TargetRelPath, source: &[u8]) -> Result<Vec<u8>> {
        self.execute_with(name, Some(target), source, None)
    }

    pub(crate) fn decrypt(&self, path: &Path, data: &[u8]) -> Result<Vec<u8>> {
        self.encryption
            .decrypt(data)
            .map_err(|source| Error::Encryption {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Interpreter and environment for a script, picked by the extension of
    /// its target name.
    pub(crate) fn script_options(&self, target_name: &str, source_name: &str) -> RunScriptOptions {
        let interpreter = Path::new(target_name)
            .extension()
            .and_then(OsStr::to_str)
            .and_then(|ext| self.interpreters.get(ext))
            .cloned();

        let mut env = self.script_env.clone();
        env.push(("CHEZMOI_SOURCE_FILE".into(), source_name.into()));

        RunScriptOptions { interpreter, env }
    }
}

/// Desired destination as described by the source directory.
pub struct SourceState {
    system: Arc<dyn System>,
    cache_system: Arc<dyn System>,
    source_dir: PathBuf,
    dest_dir: PathBuf,
    cache_dir: PathBuf,
    umask: u32,
    encryption: Arc<dyn Encryption>,
    interpreters: BTreeMap<String, Interpreter>,
    template_funcs: FuncMap,
    template_options: TemplateOptions,
    priority_data: Value,
    template_data_only: bool,
    version: semver::Version,
    fetcher: Arc<dyn Fetcher>,
    script_env: Vec<(String, String)>,
    script_temp_dir: Option<PathBuf>,

    root: BTreeMap<TargetRelPath, SourceStateEntry>,
    remove_dirs: BTreeSet<TargetRelPath>,
    ignored: BTreeSet<TargetRelPath>,
    ctx: Option<Arc<SourceContext>>,
}

impl SourceState {
    /// Construct new empty source state over `source_dir` for destination
    /// `dest_dir`. Nothing is read until [`SourceState::read`].
    pub fn new(
        system: Arc<dyn System>,
        source_dir: impl Into<PathBuf>,
        dest_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache_system: system.clone(),
            system,
            source_dir: source_dir.into(),
            dest_dir: dest_dir.into(),
            cache_dir: env::temp_dir().join("chezmoi"),
            umask: 0o022,
            encryption: Arc::new(NoEncryption),
            interpreters: BTreeMap::new(),
            template_funcs: FuncMap::new(),
            template_options: TemplateOptions::default(),
            priority_data: Value::Null,
            template_data_only: false,
            version: semver::Version::parse(env!("CARGO_PKG_VERSION"))
                .unwrap_or_else(|_| semver::Version::new(0, 0, 0)),
            fetcher: Arc::new(HttpFetcher::default()),
            script_env: Vec::new(),
            script_temp_dir: None,
            root: BTreeMap::new(),
            remove_dirs: BTreeSet::new(),
            ignored: BTreeSet::new(),
            ctx: None,
        }
    }

    /// Write downloads through a different system than the one reading the
    /// source directory.
    pub fn with_cache_system(mut self, system: Arc<dyn System>) -> Self {
        self.cache_system = system;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_umask(mut self, umask: u32) -> Self {
        self.umask = umask;
        self
    }

    pub fn with_encryption(mut self, encryption: Arc<dyn Encryption>) -> Self {
        self.encryption = encryption;
        self
    }

    /// Interpreters keyed by script extension without the leading dot.
    pub fn with_interpreters(mut self, interpreters: BTreeMap<String, Interpreter>) -> Self {
        self.interpreters = interpreters;
        self
    }

    pub fn with_template_funcs(mut self, funcs: FuncMap) -> Self {
        self.template_funcs = funcs;
        self
    }

    pub fn with_template_options(mut self, options: TemplateOptions) -> Self {
        self.template_options = options;
        self
    }

    /// Data merged over everything found in the source directory.
    pub fn with_priority_data(mut self, data: Value) -> Self {
        self.priority_data = data;
        self
    }

    /// Stop reading once template data is known.
    pub fn with_template_data_only(mut self, only: bool) -> Self {
        self.template_data_only = only;
        self
    }

    pub fn with_version(mut self, version: semver::Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_script_env(mut self, env: Vec<(String, String)>) -> Self {
        self.script_env = env;
        self
    }

    pub fn with_script_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.script_temp_dir = Some(dir.into());
        self
    }

    /// Read the source directory.
    ///
    /// A missing source directory reads as an empty source state.
    ///
    /// # Errors
    ///
    /// - Return [`Error::TooOld`] if a `.chezmoiversion` asks for a newer
    ///   version. Nothing else is read in that case.
    /// - Return [`Error::InvalidSourceName`] for names that do not parse.
    /// - Return [`Error::InconsistentState`] if two entries claim one target.
    /// - Return [`Error::Cancelled`] if `cancel` fires first.
    /// - Return [`Error`] for any failed read, render, parse, or download.
    #[instrument(level = "debug", skip_all, fields(source_dir = %self.source_dir.display()))]
    pub async fn read(&mut self, cancel: &CancellationToken, options: &ReadOptions) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.source_dir = self.resolve_root()?;
        let ctx = Arc::new(self.new_context()?);
        self.ctx = Some(ctx.clone());
        if self.template_data_only {
            return Ok(());
        }

        let mut walk = Walk::default();
        let source_dir = self.source_dir.clone();
        self.walk_dir(
            &ctx,
            &mut walk,
            &source_dir,
            &SourceRelPath::new_dir(""),
            &TargetRelPath::root(),
            false,
        )?;

        let bodies = self.fetch_externals(cancel, options, &walk.externals).await?;
        self.expand_externals(&ctx, &mut walk, &bodies)?;

        let Walk {
            mut entries,
            ignore,
            remove,
            mut ignored,
            remove_dirs,
            ..
        } = walk;

        entries.retain(|target, _| {
            if ignore.matches(target) {
                ignored.insert(target.clone());
                return false;
            }
            true
        });

        self.add_removals(&mut entries, &ignore, &remove)?;
        self.add_exact_removals(&mut entries, &ignore)?;

        let mut root = BTreeMap::new();
        for (target, candidates) in entries {
            let mut candidates = candidates.into_iter();
            let Some(first) = candidates.next() else {
                continue;
            };
            let rest: Vec<_> = candidates.collect();
            if !rest.iter().all(|entry| first.is_equivalent(entry)) {
                let mut origins: Vec<String> = std::iter::once(&first)
                    .chain(&rest)
                    .map(|entry| entry.origin().to_string())
                    .collect();
                origins.sort();
                return Err(Error::InconsistentState { target, origins });
            }
            root.insert(target, first);
        }

        info!("read {} source state entries", root.len());
        self.root = root;
        self.ignored = ignored;
        self.remove_dirs = remove_dirs;
        Ok(())
    }

    /// Entry for target path, if any.
    pub fn entry(&self, target: &TargetRelPath) -> Option<&SourceStateEntry> {
        self.root.get(target)
    }

    /// Entry for target path.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotInSourceState`] if target is not managed.
    pub fn must_entry(&self, target: &TargetRelPath) -> Result<&SourceStateEntry> {
        self.entry(target)
            .ok_or_else(|| Error::NotInSourceState(target.clone()))
    }

    /// Visit every entry in target path order, stopping at the first error.
    ///
    /// # Errors
    ///
    /// - Return whatever `visit` returns.
    pub fn for_each(
        &self,
        mut visit: impl FnMut(&TargetRelPath, &SourceStateEntry) -> Result<()>,
    ) -> Result<()> {
        for (target, entry) in &self.root {
            visit(target, entry)?;
        }

        Ok(())
    }

    /// Every managed target path, ordered by script phase then path.
    pub fn target_rel_paths(&self) -> Vec<TargetRelPath> {
        let mut paths: Vec<(ScriptOrder, &TargetRelPath)> = self
            .root
            .iter()
            .map(|(target, entry)| (entry.order(), target))
            .collect();
        paths.sort();
        paths.into_iter().map(|(_, target)| target.clone()).collect()
    }

    /// Targets dropped because of `.chezmoiignore`.
    pub fn ignored(&self) -> impl Iterator<Item = &TargetRelPath> {
        self.ignored.iter()
    }

    pub(crate) fn remove_dirs(&self) -> impl DoubleEndedIterator<Item = &TargetRelPath> {
        self.remove_dirs.iter()
    }

    /// Data every template sees.
    ///
    /// # Errors
    ///
    /// - Return [`Error`] if data could not be gathered.
    pub fn template_data(&self) -> Result<Value> {
        Ok(self.context()?.data.clone())
    }

    /// Render arbitrary template text against the source state's data.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Template`] if rendering fails.
    pub fn execute_template(&self, name: &str, source: &[u8]) -> Result<Vec<u8>> {
        self.context()?.execute_with(name, None, source, None)
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    pub fn umask(&self) -> u32 {
        self.umask
    }

    pub fn encryption(&self) -> &dyn Encryption {
        self.encryption.as_ref()
    }

    fn context(&self) -> Result<Arc<SourceContext>> {
        match &self.ctx {
            Some(ctx) => Ok(ctx.clone()),
            None => self.new_context().map(Arc::new),
        }
    }

    fn resolve_root(&self) -> Result<PathBuf> {
        let path = self.source_dir.join(ROOT_FILE);
        match self.system.read_file(&path) {
            Ok(data) => {
                let root = String::from_utf8_lossy(&data).trim().to_string();
                debug!("source root redirected to {root:?}");
                Ok(self.source_dir.join(root))
            }
            Err(err) if err.is_not_found() => Ok(self.source_dir.clone()),
            Err(err) => Err(err.into()),
        }
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        match self.system.read_dir(path) {
            Ok(entries) => Ok(entries),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn new_context(&self) -> Result<SourceContext> {
        let mut special = Special::default();
        self.scan_special(&self.source_dir, &mut special)?;

        for path in &special.versions {
            self.check_version(path)?;
        }

        let mut data = self.default_data();
        for path in &special.data {
            let text = self.read_text(path)?;
            let ext = path.extension().and_then(OsStr::to_str).unwrap_or_default();
            merge_data(&mut data, parse_document(path, ext, &text)?);
        }
        if !self.priority_data.is_null() {
            merge_data(&mut data, self.priority_data.clone());
        }

        let mut engine = TemplateEngine::new(&self.template_options);
        engine.add_function(
            "include",
            include_func(self.system.clone(), self.source_dir.clone()),
        );
        engine.add_function("output", output_func(self.system.clone()));
        engine.add_functions(&self.template_funcs);
        for dir in &special.templates {
            for path in self.list_files(dir)? {
                let name = path
                    .strip_prefix(dir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                let text = self.read_text(&path)?;
                engine
                    .add_snippet(name, text)
                    .map_err(|source| Error::Template { path, source })?;
            }
        }

        Ok(SourceContext {
            system: self.system.clone(),
            source_dir: self.source_dir.clone(),
            dest_dir: self.dest_dir.clone(),
            encryption: self.encryption.clone(),
            engine,
            data,
            interpreters: self.interpreters.clone(),
            script_env: self.script_env.clone(),
            script_temp_dir: self.script_temp_dir.clone(),
        })
    }

    fn scan_special(&self, dir: &Path, special: &mut Special) -> Result<()> {
        for entry in self.read_dir(dir)? {
            let Some(name) = entry.name.to_str() else {
                continue;
            };
            let path = dir.join(name);

            match name {
                VERSION_FILE if entry.info.is_file() => special.versions.push(path),
                TEMPLATES_DIR if entry.info.is_dir() => special.templates.push(path),
                DATA_NAME if entry.info.is_dir() => special.data.extend(self.list_files(&path)?),
                _ if name.starts_with(DATA_NAME) && entry.info.is_file() => special.data.push(path),
                _ if name.starts_with('.') => {}
                // INVARIANT: contents of external_ directories are taken
                // verbatim, so nothing inside them is special.
                _ if entry.info.is_dir() => {
                    if DirAttr::parse(name).is_ok_and(|attr| !attr.external) {
                        self.scan_special(&path, special)?;
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in self.read_dir(dir)? {
            let path = dir.join(&entry.name);
            if entry.info.is_dir() {
                files.extend(self.list_files(&path)?);
            } else {
                files.push(path);
            }
        }

        Ok(files)
    }

    fn read_text(&self, path: &Path) -> Result<String> {
        let data = self.system.read_file(path)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    fn check_version(&self, path: &Path) -> Result<()> {
        let text = self.read_text(path)?;
        let need = semver::Version::parse(text.trim()).map_err(|source| Error::InvalidVersion {
            path: path.to_path_buf(),
            source,
        })?;

        if need > self.version {
            return Err(Error::TooOld {
                have: self.version.clone(),
                need,
            });
        }

        Ok(())
    }

    fn default_data(&self) -> Value {
        let lossy = |path: &Path| path.to_string_lossy().into_owned();
        json!({
            "chezmoi": {
                "sourceDir": lossy(&self.source_dir),
                "destDir": lossy(&self.dest_dir),
                "homeDir": home_dir().map(|path| lossy(&path)).unwrap_or_default(),
                "cacheDir": lossy(&self.cache_dir),
                "os": env::consts::OS,
                "arch": env::consts::ARCH,
                "hostname": hostname(),
                "username": username(),
                "version": self.version.to_string(),
            }
        })
    }

    fn walk_dir(
        &self,
        ctx: &Arc<SourceContext>,
        walk: &mut Walk,
        dir: &Path,
        source_rel: &SourceRelPath,
        target_dir: &TargetRelPath,
        scripts_only: bool,
    ) -> Result<()> {
        let listing = self.read_dir(dir)?;

        for entry in &listing {
            let Some(name) = entry.name.to_str() else {
                continue;
            };
            if !entry.info.is_file() {
                continue;
            }

            let path = dir.join(name);
            let rel = source_rel.join_file(name);
            if name == IGNORE_FILE {
                let text = self.render_special(ctx, &rel, &path)?;
                walk.ignore
                    .add_lines(target_dir, &text)
                    .map_err(|source| Error::Pattern { path, source })?;
            } else if name == REMOVE_FILE {
                let text = self.render_special(ctx, &rel, &path)?;
                walk.remove
                    .add_lines(target_dir, &text)
                    .map_err(|source| Error::Pattern { path, source })?;
            } else if let Some(format) = name.strip_prefix(EXTERNAL_PREFIX) {
                let (format, text) = match format.strip_suffix(TEMPLATE_SUFFIX) {
                    Some(format) => (format, self.render_special(ctx, &rel, &path)?),
                    None => (format, self.read_text(&path)?),
                };
                for (key, external) in parse_manifest(&path, format, &text)? {
                    walk.externals.push(PendingExternal {
                        target: target_dir.join(key.trim_matches('/')),
                        external,
                        defined_in: path.clone(),
                    });
                }
            }
        }

        for entry in listing {
            let Some(name) = entry.name.to_str() else {
                warn!("skip non UTF-8 source name {:?}", dir.join(&entry.name).display());
                continue;
            };
            let path = dir.join(name);

            if name == SCRIPTS_DIR && entry.info.is_dir() {
                let rel = source_rel.join_dir(name);
                self.walk_dir(ctx, walk, &path, &rel, target_dir, true)?;
                continue;
            }
            if name.starts_with('.') {
                continue;
            }

            if entry.info.is_dir() {
                let rel = source_rel.join_dir(name);
                if scripts_only {
                    self.walk_dir(ctx, walk, &path, &rel, target_dir, true)?;
                    continue;
                }

                let attr = DirAttr::parse(name).map_err(|source| Error::InvalidSourceName {
                    path: path.clone(),
                    source,
                })?;
                let target = target_dir.join(&attr.target_name);
                if walk.ignore.matches(&target) {
                    walk.ignored.insert(target);
                    continue;
                }

                if attr.remove {
                    walk.remove_dirs.insert(target.clone());
                }
                let external = attr.external;
                walk.add(
                    target.clone(),
                    SourceStateEntry::Dir(SourceDir {
                        source_rel_path: Some(rel.clone()),
                        perm: attr.perm() & !self.umask,
                        attr,
                        origin: Origin::Source(path.clone()),
                    }),
                );

                if external {
                    self.walk_external_dir(ctx, walk, &path, &rel, &target)?;
                } else {
                    self.walk_dir(ctx, walk, &path, &rel, &target, false)?;
                }
            } else if entry.info.is_file() {
                let attr = FileAttr::parse(name, self.encryption.encrypted_suffix()).map_err(
                    |source| Error::InvalidSourceName {
                        path: path.clone(),
                        source,
                    },
                )?;
                if scripts_only && attr.kind != SourceFileKind::Script {
                    return Err(Error::NotAScript { path });
                }

                let target = target_dir.join(&attr.target_name);
                if walk.ignore.matches(&target) {
                    walk.ignored.insert(target);
                    continue;
                }

                let rel = source_rel.join_file(name);
                let entry = self.source_file(ctx, path, rel, target.clone(), attr);
                walk.add(target, entry);
            } else {
                return Err(Error::UnsupportedFileType { path });
            }
        }

        Ok(())
    }

    fn render_special(
        &self,
        ctx: &SourceContext,
        rel: &SourceRelPath,
        path: &Path,
    ) -> Result<String> {
        let data = self.system.read_file(path)?;
        let name = rel.as_path().to_string_lossy();
        let rendered = ctx.execute_with(&name, None, &data, None)?;
        Ok(String::from_utf8_lossy(&rendered).into_owned())
    }

    fn source_file(
        &self,
        ctx: &Arc<SourceContext>,
        path: PathBuf,
        rel: SourceRelPath,
        target: TargetRelPath,
        attr: FileAttr,
    ) -> SourceStateEntry {
        let contents = {
            let ctx = ctx.clone();
            let path = path.clone();
            let name = rel.as_path().to_string_lossy().into_owned();
            let target = target.clone();
            let encrypted = attr.is_encrypted();
            let template = attr.template;
            Arc::new(Lazy::new(move || {
                let mut data = ctx.system.read_file(&path)?;
                if encrypted {
                    data = ctx.decrypt(&path, &data)?;
                }
                if template {
                    data = ctx.execute(&name, &target, &data)?;
                }
                Ok(data)
            }))
        };

        SourceStateEntry::File(SourceFile {
            source_rel_path: Some(rel),
            target_rel_path: target,
            perm: attr.perm() & !self.umask,
            attr,
            origin: Origin::Source(path),
            contents,
            ctx: ctx.clone(),
        })
    }

    fn walk_external_dir(
        &self,
        ctx: &Arc<SourceContext>,
        walk: &mut Walk,
        dir: &Path,
        source_rel: &SourceRelPath,
        target_dir: &TargetRelPath,
    ) -> Result<()> {
        for entry in self.read_dir(dir)? {
            let Some(name) = entry.name.to_str() else {
                warn!("skip non UTF-8 source name {:?}", dir.join(&entry.name).display());
                continue;
            };
            let path = dir.join(name);
            let target = target_dir.join(name);
            if walk.ignore.matches(&target) {
                walk.ignored.insert(target);
                continue;
            }

            let origin = Origin::Source(path.clone());
            if entry.info.is_dir() {
                let rel = source_rel.join_dir(name);
                walk.add(
                    target.clone(),
                    SourceStateEntry::Dir(SourceDir {
                        source_rel_path: Some(rel.clone()),
                        attr: DirAttr::new(name),
                        origin,
                        perm: 0o777 & !self.umask,
                    }),
                );
                self.walk_external_dir(ctx, walk, &path, &rel, &target)?;
                continue;
            }

            let perm = entry.info.perm;
            let (attr, contents): (FileAttr, Contents) = match entry.info.kind {
                FileKind::File => {
                    let mut attr = FileAttr::new(name, SourceFileKind::File);
                    attr.empty = true;
                    attr.executable = perm & 0o111 != 0;
                    attr.private = perm & 0o077 == 0;
                    attr.readonly = perm & 0o222 == 0;
                    let system = self.system.clone();
                    let read_path = path.clone();
                    (
                        attr,
                        Arc::new(Lazy::new(move || {
                            system.read_file(&read_path).map_err(Into::into)
                        })),
                    )
                }
                FileKind::Symlink => {
                    let system = self.system.clone();
                    let read_path = path.clone();
                    (
                        FileAttr::new(name, SourceFileKind::Symlink),
                        Arc::new(Lazy::new(move || {
                            let linkname = system.read_link(&read_path)?;
                            Ok(linkname.to_string_lossy().into_owned().into_bytes())
                        })),
                    )
                }
                _ => return Err(Error::UnsupportedFileType { path }),
            };

            walk.add(
                target.clone(),
                SourceStateEntry::File(SourceFile {
                    source_rel_path: Some(source_rel.join_file(name)),
                    target_rel_path: target,
                    perm: attr.perm() & !self.umask,
                    attr,
                    origin,
                    contents,
                    ctx: ctx.clone(),
                }),
            );
        }

        Ok(())
    }

    async fn fetch_externals(
        &self,
        cancel: &CancellationToken,
        options: &ReadOptions,
        pending: &[PendingExternal],
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut urls: BTreeMap<String, Duration> = BTreeMap::new();
        for pending in pending {
            if pending.external.kind == ExternalKind::GitRepo {
                continue;
            }
            let period = urls
                .entry(pending.external.url.clone())
                .or_insert(pending.external.refresh_period);
            *period = (*period).min(pending.external.refresh_period);
        }
        if urls.is_empty() {
            return Ok(BTreeMap::new());
        }

        let cache = Cache {
            system: self.cache_system.as_ref(),
            dir: self.cache_dir.clone(),
            fetcher: self.fetcher.as_ref(),
            policy: options.refresh_externals,
        };
        let cache = &cache;
        let fetches = stream::iter(urls)
            .map(|(url, period)| async move {
                let data = cache.get(&url, period).await?;
                Ok::<_, Error>((url, data))
            })
            .buffer_unordered(MAX_CONCURRENT_FETCHES)
            .try_collect::<BTreeMap<String, Vec<u8>>>();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            bodies = fetches => bodies,
        }
    }

    fn expand_externals(
        &self,
        ctx: &Arc<SourceContext>,
        walk: &mut Walk,
        bodies: &BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        for pending in std::mem::take(&mut walk.externals) {
            let PendingExternal {
                target,
                external,
                defined_in,
            } = pending;
            let origin = Origin::External {
                url: external.url.clone(),
                defined_in,
            };
            self.add_implicit_parents(walk, &target, &origin);

            match external.kind {
                ExternalKind::File => {
                    let data = self.download(ctx, &target, &external, bodies)?;
                    let name = target_name(&target);
                    let mut attr = FileAttr::new(name, SourceFileKind::File);
                    attr.empty = true;
                    attr.executable = external.executable;
                    attr.private = external.private;
                    attr.readonly = external.readonly;
                    walk.add(
                        target.clone(),
                        SourceStateEntry::File(SourceFile {
                            source_rel_path: None,
                            target_rel_path: target,
                            perm: attr.perm() & !self.umask,
                            attr,
                            origin,
                            contents: Arc::new(Lazy::ready(data)),
                            ctx: ctx.clone(),
                        }),
                    );
                }
                ExternalKind::Archive => {
                    let data = self.download(ctx, &target, &external, bodies)?;
                    self.expand_archive(ctx, walk, &target, &external, &origin, &data)?;
                }
                ExternalKind::GitRepo => {
                    let command = self.git_command(&target, &external)?;
                    let entry = command_entry(origin, command, &external);
                    walk.add(target, SourceStateEntry::Command(entry));
                }
            }
        }

        Ok(())
    }

    fn download(
        &self,
        ctx: &SourceContext,
        target: &TargetRelPath,
        external: &External,
        bodies: &BTreeMap<String, Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let data = bodies.get(&external.url).ok_or_else(|| Error::External {
            target: target.clone(),
            reason: format!("nothing was downloaded from {}", external.url),
        })?;
        verify_checksum(target, &external.checksum, data)?;

        if external.encrypted {
            return ctx.decrypt(Path::new(&external.url), data);
        }

        Ok(data.clone())
    }

    fn expand_archive(
        &self,
        ctx: &Arc<SourceContext>,
        walk: &mut Walk,
        target: &TargetRelPath,
        external: &External,
        origin: &Origin,
        data: &[u8],
    ) -> Result<()> {
        let members = read_archive(data, external.strip_components).map_err(|err| {
            Error::External {
                target: target.clone(),
                reason: format!("invalid archive: {err}"),
            }
        })?;

        let mut attr = DirAttr::new(target_name(target));
        attr.exact = external.exact;
        attr.private = external.private;
        attr.readonly = external.readonly;
        walk.add(
            target.clone(),
            SourceStateEntry::Dir(SourceDir {
                source_rel_path: None,
                perm: attr.perm() & !self.umask,
                attr,
                origin: origin.clone(),
            }),
        );

        for member in members {
            let member_target = target.join(&member.path);
            self.add_implicit_parents(walk, &member_target, origin);
            let name = target_name(&member_target);

            let entry = match member.kind {
                MemberKind::Dir => SourceStateEntry::Dir(SourceDir {
                    source_rel_path: None,
                    attr: DirAttr::new(name),
                    origin: origin.clone(),
                    perm: 0o777 & !self.umask,
                }),
                MemberKind::File(contents) => {
                    let mut attr = FileAttr::new(name, SourceFileKind::File);
                    attr.empty = true;
                    attr.executable = external.executable || member.mode & 0o111 != 0;
                    attr.private = external.private;
                    attr.readonly = external.readonly;
                    SourceStateEntry::File(SourceFile {
                        source_rel_path: None,
                        target_rel_path: member_target.clone(),
                        perm: attr.perm() & !self.umask,
                        attr,
                        origin: origin.clone(),
                        contents: Arc::new(Lazy::ready(contents)),
                        ctx: ctx.clone(),
                    })
                }
                MemberKind::Symlink(linkname) => {
                    let attr = FileAttr::new(name, SourceFileKind::Symlink);
                    SourceStateEntry::File(SourceFile {
                        source_rel_path: None,
                        target_rel_path: member_target.clone(),
                        perm: attr.perm() & !self.umask,
                        attr,
                        origin: origin.clone(),
                        contents: Arc::new(Lazy::ready(linkname.into_bytes())),
                        ctx: ctx.clone(),
                    })
                }
            };
            walk.add(member_target, entry);
        }

        Ok(())
    }

    fn git_command(&self, target: &TargetRelPath, external: &External) -> Result<DirCommand> {
        let dest = target.to_abs(&self.dest_dir);
        match self.system.lstat(&dest) {
            Ok(_) => Ok(DirCommand {
                program: "git".into(),
                args: std::iter::once("pull".to_string())
                    .chain(external.pull.args.iter().cloned())
                    .collect(),
                dir: dest,
            }),
            Err(err) if err.is_not_found() => {
                let mut args = vec!["clone".to_string()];
                args.extend(external.clone.args.iter().cloned());
                args.push(external.url.clone());
                args.push(dest.to_string_lossy().into_owned());
                Ok(DirCommand {
                    program: "git".into(),
                    args,
                    dir: dest.parent().unwrap_or(&self.dest_dir).to_path_buf(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn add_implicit_parents(&self, walk: &mut Walk, target: &TargetRelPath, origin: &Origin) {
        let mut parent = target.parent();
        while let Some(dir) = parent {
            if dir.is_empty() {
                break;
            }
            if !walk.entries.contains_key(&dir) {
                walk.add(
                    dir.clone(),
                    SourceStateEntry::Dir(SourceDir {
                        source_rel_path: None,
                        attr: DirAttr::new(target_name(&dir)),
                        origin: origin.clone(),
                        perm: 0o777 & !self.umask,
                    }),
                );
            }
            parent = dir.parent();
        }
    }

    fn add_removals(
        &self,
        entries: &mut BTreeMap<TargetRelPath, Vec<SourceStateEntry>>,
        ignore: &PatternSet,
        remove: &PatternSet,
    ) -> Result<()> {
        let patterns: Vec<String> = remove.include_patterns().map(str::to_string).collect();
        for pattern in patterns {
            let mut found = BTreeSet::new();
            let components: Vec<&str> = pattern.split('/').filter(|part| !part.is_empty()).collect();
            self.glob_dest(&TargetRelPath::root(), &components, &mut found)?;

            for target in found {
                if remove.is_excluded(target.as_path()) || ignore.matches(&target) {
                    continue;
                }
                debug!("remove {target} per {REMOVE_FILE}");
                entries.entry(target).or_default().push(removal());
            }
        }

        Ok(())
    }

    fn glob_dest(
        &self,
        dir: &TargetRelPath,
        components: &[&str],
        found: &mut BTreeSet<TargetRelPath>,
    ) -> Result<()> {
        let Some((first, rest)) = components.split_first() else {
            if !dir.is_empty() {
                found.insert(dir.clone());
            }
            return Ok(());
        };

        let listing = self.read_dir(&dir.to_abs(&self.dest_dir))?;
        if *first == "**" {
            self.glob_dest(dir, rest, found)?;
            for child in listing.iter().filter(|child| child.info.is_dir()) {
                self.glob_dest(&dir.join(&child.name), components, found)?;
            }
            return Ok(());
        }

        let pattern = glob::Pattern::new(first).map_err(|source| Error::Glob {
            pattern: first.to_string(),
            source,
        })?;
        for child in listing {
            let Some(name) = child.name.to_str() else {
                continue;
            };
            if !pattern.matches(name) {
                continue;
            }

            let path = dir.join(name);
            if rest.is_empty() {
                found.insert(path);
            } else if child.info.is_dir() {
                self.glob_dest(&path, rest, found)?;
            }
        }

        Ok(())
    }

    fn add_exact_removals(
        &self,
        entries: &mut BTreeMap<TargetRelPath, Vec<SourceStateEntry>>,
        ignore: &PatternSet,
    ) -> Result<()> {
        let exact: Vec<TargetRelPath> = entries
            .iter()
            .filter(|(_, candidates)| {
                candidates
                    .iter()
                    .any(|entry| matches!(entry, SourceStateEntry::Dir(dir) if dir.attr.exact))
            })
            .map(|(target, _)| target.clone())
            .collect();

        for dir in exact {
            for child in self.read_dir(&dir.to_abs(&self.dest_dir))? {
                let target = dir.join(&child.name);
                if entries.contains_key(&target) || ignore.matches(&target) {
                    continue;
                }
                debug!("remove {target} from exact directory");
                entries.insert(target, vec![removal()]);
            }
        }

        Ok(())
    }
}

#[derive(Default)]
struct Special {
    versions: Vec<PathBuf>,
    data: Vec<PathBuf>,
    templates: Vec<PathBuf>,
}

struct PendingExternal {
    target: TargetRelPath,
    external: External,
    defined_in: PathBuf,
}

#[derive(Default)]
struct Walk {
    entries: BTreeMap<TargetRelPath, Vec<SourceStateEntry>>,
    externals: Vec<PendingExternal>,
    ignore: PatternSet,
    remove: PatternSet,
    ignored: BTreeSet<TargetRelPath>,
    remove_dirs: BTreeSet<TargetRelPath>,
}

impl Walk {
    fn add(&mut self, target: TargetRelPath, entry: SourceStateEntry) {
        self.entries.entry(target).or_default().push(entry);
    }
}

fn removal() -> SourceStateEntry {
    SourceStateEntry::Remove(SourceRemove {
        source_rel_path: None,
        origin: Origin::Remove,
    })
}

fn command_entry(origin: Origin, command: DirCommand, external: &External) -> SourceCommand {
    let force_refresh = command.args.first().is_some_and(|arg| arg == "clone");
    SourceCommand {
        origin,
        command,
        refresh_period: external.refresh_period,
        force_refresh,
    }
}

fn target_name(target: &TargetRelPath) -> String {
    target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Parse a document in the format named by `ext`: `json`, `toml`, or
/// `yaml`.
pub(crate) fn parse_document<T: DeserializeOwned>(path: &Path, ext: &str, text: &str) -> Result<T> {
    match ext {
        "json" => serde_json::from_str(text).map_err(|err| Error::parse(path)(err.into())),
        "toml" => toml::from_str(text).map_err(|err| Error::parse(path)(err.into())),
        "yaml" | "yml" => serde_yaml::from_str(text).map_err(|err| Error::parse(path)(err.into())),
        other => Err(Error::parse(path)(
            format!("unknown document format {other:?}").into(),
        )),
    }
}

/// Merge `src` into `dest`, recursing into objects present in both.
pub(crate) fn merge_data(dest: &mut Value, src: Value) {
    match (dest, src) {
        (Value::Object(dest), Value::Object(src)) => {
            for (key, value) in src {
                match dest.get_mut(&key) {
                    Some(existing) => merge_data(existing, value),
                    None => {
                        dest.insert(key, value);
                    }
                }
            }
        }
        (dest, src) => *dest = src,
    }
}

#[cfg(unix)]
fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(not(unix))]
fn hostname() -> String {
    env::var("COMPUTERNAME").unwrap_or_default()
}

#[cfg(unix)]
fn username() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .or_else(|| env::var("USER").ok())
        .unwrap_or_default()
}

#[cfg(not(unix))]
fn username() -> String {
    env::var("USERNAME").unwrap_or_default()
}
