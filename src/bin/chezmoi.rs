// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use chezmoi::{
    apply::{self, status_line, ApplyRequest, PreApply, PreApplyArgs, PreApplyFn},
    config::{Config, Context, Overrides},
    error::Result as EngineResult,
    filter::{EntryTypeSet, Filter},
    path::{default_config_file, TargetRelPath},
    source::{AddOptions, HttpFetcher, ReadOptions, RefreshExternals, SourceState},
    state::{
        Bucket, DebugState, DryRunState, MemoryState, PersistentState, ReadOnlyState, RedbState,
    },
    system::{
        DebugSystem, DiffWriter, DryRunSystem, ExternalDiffSystem, GitDiffSystem, ReadOnlySystem,
        RealSystem, System,
    },
};

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::{
    collections::BTreeMap,
    env,
    io::{self, IsTerminal, Read, Write},
    path::{Path, PathBuf},
    process::exit,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "chezmoi [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let global = self.global;
        match self.command {
            Command::Apply(opts) => run_apply(&global, opts).await,
            Command::Diff(opts) => run_diff(&global, opts).await,
            Command::Status => run_status(&global).await,
            Command::Add(opts) => run_add(&global, opts).await,
            Command::Managed => run_managed(&global).await,
            Command::Cat(opts) => run_cat(&global, opts).await,
            Command::Data(opts) => run_data(&global, opts).await,
            Command::ExecuteTemplate(opts) => run_execute_template(&global, opts).await,
            Command::State(StateCommand::Dump) => run_state_dump(&global),
            Command::State(StateCommand::DeleteBucket(opts)) => run_state_delete_bucket(&global, opts),
        }
    }
}

#[derive(Args, Clone, Debug)]
struct GlobalOptions {
    /// Use directory as source directory.
    #[arg(short = 'S', long = "source", global = true, value_name = "dir")]
    pub source: Option<PathBuf>,

    /// Use directory as destination directory.
    #[arg(short = 'D', long = "destination", global = true, value_name = "dir")]
    pub destination: Option<PathBuf>,

    /// Read configuration from file.
    #[arg(short, long, global = true, value_name = "file")]
    pub config: Option<PathBuf>,

    /// Do not make any modifications to the destination directory.
    #[arg(short = 'n', long, global = true)]
    pub dry_run: bool,

    /// Show changes as they are made.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Make all changes without prompting.
    #[arg(long, global = true)]
    pub force: bool,

    /// Prompt for every change.
    #[arg(long, global = true)]
    pub interactive: bool,

    /// Keep going as far as possible after an error.
    #[arg(short, long, global = true)]
    pub keep_going: bool,

    /// Log every system and state operation.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Only operate on these entry types.
    #[arg(short, long, global = true, value_name = "types")]
    pub include: Option<EntryTypeSet>,

    /// Never operate on these entry types.
    #[arg(short = 'x', long, global = true, value_name = "types")]
    pub exclude: Option<EntryTypeSet>,

    /// When to refresh externals.
    #[arg(long, global = true, value_name = "auto|always|never", default_value = "auto")]
    pub refresh_externals: RefreshExternals,
}

impl GlobalOptions {
    fn filter(&self) -> Filter {
        Filter::new(
            self.include.unwrap_or(EntryTypeSet::ALL),
            self.exclude.unwrap_or(EntryTypeSet::NONE),
        )
    }

    fn apply_request(&self) -> ApplyRequest {
        ApplyRequest {
            force: self.force,
            interactive: self.interactive,
            keep_going: self.keep_going,
            dry_run: self.dry_run,
            verbose: self.verbose,
            filter: self.filter(),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Update destination directory to match source state.
    #[command(override_usage = "chezmoi apply [options] [<path>]...")]
    Apply(PathOptions),

    /// Show what apply would change.
    #[command(override_usage = "chezmoi diff [options] [<path>]...")]
    Diff(PathOptions),

    /// Show status of every managed target.
    #[command(override_usage = "chezmoi status [options]")]
    Status,

    /// Add destination paths to source state.
    #[command(override_usage = "chezmoi add [options] <path>...")]
    Add(AddCmdOptions),

    /// List managed targets.
    #[command(override_usage = "chezmoi managed [options]")]
    Managed,

    /// Print target contents.
    #[command(override_usage = "chezmoi cat [options] <path>...")]
    Cat(CatOptions),

    /// Print template data.
    #[command(override_usage = "chezmoi data [options]")]
    Data(DataOptions),

    /// Render templates with source state data.
    #[command(override_usage = "chezmoi execute-template [options] [<template>]...")]
    ExecuteTemplate(ExecuteTemplateOptions),

    /// Inspect or change persistent state.
    #[command(subcommand)]
    State(StateCommand),
}

#[derive(Debug, Clone, Subcommand)]
enum StateCommand {
    /// Print every bucket of persistent state as JSON.
    Dump,

    /// Remove every value of a bucket.
    DeleteBucket(DeleteBucketOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PathOptions {
    /// Only operate on these destination paths.
    #[arg(value_name = "path")]
    pub paths: Vec<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct AddCmdOptions {
    /// Destination paths to add.
    #[arg(required = true, value_name = "path")]
    pub paths: Vec<PathBuf>,

    /// Encrypt files with configured encryption tool.
    #[arg(long)]
    pub encrypt: bool,

    /// Add files as templates.
    #[arg(short = 'T', long)]
    pub template: bool,

    /// Add files so they are only ever created.
    #[arg(long)]
    pub create: bool,

    /// Keep empty files.
    #[arg(long)]
    pub empty: bool,

    /// Add directories as exact.
    #[arg(long)]
    pub exact: bool,

    /// Add directory contents too.
    #[arg(short, long, default_value_t = true, action = clap::ArgAction::Set)]
    pub recursive: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CatOptions {
    /// Destination paths to print.
    #[arg(required = true, value_name = "path")]
    pub paths: Vec<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DataOptions {
    /// Output format.
    #[arg(short, long, value_name = "json|yaml", default_value = "json")]
    pub format: DataFormat,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum DataFormat {
    Json,
    Yaml,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ExecuteTemplateOptions {
    /// Templates to render. Standard input is rendered if none are given.
    #[arg(value_name = "template")]
    pub templates: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DeleteBucketOptions {
    /// Name of bucket to clear.
    #[arg(required = true, value_name = "bucket")]
    pub bucket: Bucket,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let level = if cli.global.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = cli.run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

/// How a command may touch the destination and the persistent state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mode {
    /// Changes go through unless `--dry-run` is given.
    ReadWrite,

    /// Changes are computed, then dropped.
    DryRun,

    /// Any change is an error.
    ReadOnly,
}

/// Everything one command runs with.
struct Session {
    mode: Mode,
    context: Context,
    base: Arc<dyn System>,
    system: Arc<dyn System>,
    state: Arc<dyn PersistentState>,
}

impl Session {
    fn open(global: &GlobalOptions, mode: Mode) -> Result<Self> {
        let mode = match mode {
            Mode::ReadWrite if global.dry_run => Mode::DryRun,
            mode => mode,
        };

        let mut real = RealSystem::new();
        let config_file = match &global.config {
            Some(path) => path.clone(),
            None => default_config_file()?,
        };
        let config = load_config(&real, &config_file)?;
        let overrides = Overrides {
            source_dir: global.source.clone().map(absolute).transpose()?,
            dest_dir: global.destination.clone().map(absolute).transpose()?,
            config_file: global.config.clone(),
        };
        let context = Context::new(&config, &overrides, &config_file)?;
        if let Some(dir) = context.script_temp_dir() {
            real = real.with_script_temp_dir(dir);
        }

        let mut base: Arc<dyn System> = Arc::new(real);
        if global.debug {
            base = Arc::new(DebugSystem::new(base));
        }
        let system: Arc<dyn System> = match mode {
            Mode::ReadWrite => base.clone(),
            Mode::DryRun => Arc::new(DryRunSystem::new(base.clone())),
            Mode::ReadOnly => Arc::new(ReadOnlySystem::new(base.clone())),
        };

        let mut state = open_state(context.state_file(), mode)?;
        if global.debug {
            state = Arc::new(DebugState::new(state));
        }

        Ok(Self {
            mode,
            context,
            base,
            system,
            state,
        })
    }

    fn source_state(&self) -> Result<SourceState> {
        let ctx = &self.context;
        let mut source = SourceState::new(self.system.clone(), ctx.source_dir(), ctx.dest_dir())
            .with_cache_system(self.base.clone())
            .with_cache_dir(ctx.cache_dir())
            .with_umask(ctx.umask())
            .with_encryption(ctx.encryption())
            .with_interpreters(ctx.interpreters().clone())
            .with_priority_data(ctx.data().clone())
            .with_fetcher(Arc::new(HttpFetcher::new()?))
            .with_script_env(vec![
                ("CHEZMOI".into(), "1".into()),
                ("CHEZMOI_SOURCE_DIR".into(), ctx.source_dir().display().to_string()),
                ("CHEZMOI_DEST_DIR".into(), ctx.dest_dir().display().to_string()),
                ("CHEZMOI_CONFIG_FILE".into(), ctx.config_file().display().to_string()),
            ]);
        if let Some(dir) = ctx.script_temp_dir() {
            source = source.with_script_temp_dir(dir);
        }

        Ok(source)
    }

    /// Read the source state, showing a spinner while it takes.
    async fn read(&self, global: &GlobalOptions) -> Result<SourceState> {
        if self.mode != Mode::ReadOnly
            && self.context.config_template_changed(self.base.as_ref(), self.state.as_ref())?
        {
            warn!("config file template has changed, regenerate config file to pick it up");
        }

        let mut source = self.source_state()?;
        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
        bar.set_message("reading source state");
        bar.enable_steady_tick(Duration::from_millis(100));

        let cancel = CancellationToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };

        let options = ReadOptions {
            refresh_externals: global.refresh_externals,
        };
        let result = source.read(&cancel, &options).await;
        interrupt.abort();
        bar.finish_and_clear();
        result.context("failed to read source state")?;

        Ok(source)
    }

    /// Managed targets selected by `paths`, every target if empty.
    fn targets(&self, source: &SourceState, paths: &[PathBuf]) -> Result<Vec<TargetRelPath>> {
        let all = source.target_rel_paths();
        if paths.is_empty() {
            return Ok(all);
        }

        let mut wanted = Vec::new();
        for path in paths {
            let target = self.target(path)?;
            source.must_entry(&target)?;
            wanted.push(target);
        }

        Ok(all
            .into_iter()
            .filter(|target| wanted.iter().any(|want| target == want || target.is_inside(want)))
            .collect())
    }

    fn target(&self, path: &Path) -> Result<TargetRelPath> {
        let path = absolute(path.to_path_buf())?;
        TargetRelPath::from_abs(self.context.dest_dir(), &path).with_context(|| {
            format!(
                "{} is not in destination directory {}",
                path.display(),
                self.context.dest_dir().display()
            )
        })
    }
}

fn load_config(system: &dyn System, path: &Path) -> Result<Config> {
    match system.read_file(path) {
        Ok(data) => String::from_utf8_lossy(&data)
            .parse()
            .with_context(|| format!("failed to parse {}", path.display())),
        Err(err) if err.is_not_found() => Ok(Config::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn open_state(path: &Path, mode: Mode) -> Result<Arc<dyn PersistentState>> {
    if mode != Mode::ReadWrite && !path.exists() {
        return Ok(Arc::new(MemoryState::new()));
    }

    let store: Arc<dyn PersistentState> = Arc::new(
        RedbState::open(path).with_context(|| format!("failed to open {}", path.display()))?,
    );
    Ok(match mode {
        Mode::ReadWrite => store,
        Mode::DryRun => Arc::new(DryRunState::new(store.as_ref())?),
        Mode::ReadOnly => Arc::new(ReadOnlyState::new(store)),
    })
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }

    Ok(env::current_dir()?.join(path))
}

async fn run_apply(global: &GlobalOptions, opts: PathOptions) -> Result<()> {
    let session = Session::open(global, Mode::ReadWrite)?;
    let source = session.read(global).await?;
    let targets = session.targets(&source, &opts.paths)?;

    let request = global.apply_request();
    let mut policy = request.conflict_policy(io::stdin().is_terminal());
    let target_system: Arc<dyn System> = if request.verbose {
        let writer: DiffWriter = Arc::new(Mutex::new(io::stdout()));
        Arc::new(GitDiffSystem::new(
            session.system.clone(),
            writer,
            session.context.dest_dir(),
        ))
    } else {
        session.system.clone()
    };
    let mut options = apply::ApplyOptions {
        filter: request.filter,
        umask: session.context.umask(),
        pre_apply: Some(apply::default_pre_apply(&mut policy)),
    };

    let report = source.apply_all(
        target_system.as_ref(),
        session.system.as_ref(),
        session.state.as_ref(),
        &targets,
        &mut options,
        request.keep_going,
    )?;
    if let Some(code) = report.aborted {
        exit(code);
    }

    info!(
        "{} applied, {} unchanged, {} skipped",
        report.applied, report.unchanged, report.skipped
    );
    Ok(())
}

async fn run_diff(global: &GlobalOptions, opts: PathOptions) -> Result<()> {
    let session = Session::open(global, Mode::DryRun)?;
    let source = session.read(global).await?;
    let targets = session.targets(&source, &opts.paths)?;

    let diff_config = session.context.diff();
    let mut filter = global.filter();
    let mut exclude = EntryTypeSet::NONE;
    if let Some(types) = &diff_config.exclude {
        exclude = types.parse()?;
        filter = filter.excluding(exclude);
    }

    let dest_dir = session.context.dest_dir();
    let target_system: Arc<dyn System> = match &diff_config.command {
        Some(command) => Arc::new(ExternalDiffSystem::new(
            session.system.clone(),
            command.clone(),
            diff_config.args.clone(),
            dest_dir,
        )?),
        None => {
            let writer: DiffWriter = Arc::new(Mutex::new(io::stdout()));
            let include_scripts = !exclude.contains(EntryTypeSet::SCRIPTS);
            Arc::new(GitDiffSystem::new(session.system.clone(), writer, dest_dir).with_scripts(include_scripts))
        }
    };

    let mut options = apply::ApplyOptions {
        filter,
        umask: session.context.umask(),
        pre_apply: None,
    };
    source.apply_all(
        target_system.as_ref(),
        session.system.as_ref(),
        session.state.as_ref(),
        &targets,
        &mut options,
        global.keep_going,
    )?;

    Ok(())
}

async fn run_status(global: &GlobalOptions) -> Result<()> {
    let session = Session::open(global, Mode::DryRun)?;
    let source = session.read(global).await?;
    let targets = source.target_rel_paths();

    let mut lines = Vec::new();
    let pre_apply: PreApplyFn<'_> = Box::new(|args: &PreApplyArgs<'_>| -> EngineResult<PreApply> {
        lines.extend(status_line(args));
        Ok(PreApply::Skip)
    });
    let mut options = apply::ApplyOptions {
        filter: global.filter(),
        umask: session.context.umask(),
        pre_apply: Some(pre_apply),
    };
    source.apply_all(
        session.system.as_ref(),
        session.system.as_ref(),
        session.state.as_ref(),
        &targets,
        &mut options,
        global.keep_going,
    )?;
    drop(options);

    let mut stdout = io::stdout().lock();
    for line in lines {
        writeln!(stdout, "{line}")?;
    }

    Ok(())
}

async fn run_add(global: &GlobalOptions, opts: AddCmdOptions) -> Result<()> {
    let session = Session::open(global, Mode::ReadWrite)?;
    let source = session.read(global).await?;

    let paths = opts
        .paths
        .into_iter()
        .map(absolute)
        .collect::<Result<Vec<_>>>()?;
    let options = AddOptions {
        encrypt: opts.encrypt,
        template: opts.template,
        create: opts.create,
        empty: opts.empty,
        exact: opts.exact,
        recursive: opts.recursive,
        filter: global.filter(),
    };
    source.add(
        session.system.as_ref(),
        session.state.as_ref(),
        session.system.as_ref(),
        &paths,
        &options,
    )?;

    Ok(())
}

async fn run_managed(global: &GlobalOptions) -> Result<()> {
    let session = Session::open(global, Mode::ReadOnly)?;
    let source = session.read(global).await?;
    let filter = global.filter();

    let mut stdout = io::stdout().lock();
    for target in source.target_rel_paths() {
        let Some(entry) = source.entry(&target) else {
            continue;
        };
        if target.is_empty() || !filter.includes(entry.entry_type()) {
            continue;
        }
        writeln!(stdout, "{target}")?;
    }

    Ok(())
}

async fn run_cat(global: &GlobalOptions, opts: CatOptions) -> Result<()> {
    let session = Session::open(global, Mode::ReadOnly)?;
    let source = session.read(global).await?;

    let mut stdout = io::stdout().lock();
    for path in &opts.paths {
        let target = session.target(path)?;
        let entry = source.must_entry(&target)?;
        let dest_path = target.to_abs(session.context.dest_dir());
        let target_entry = entry.target_state_entry(session.system.as_ref(), &dest_path)?;
        match target_entry.contents()? {
            Some(contents) => stdout.write_all(&contents)?,
            None => bail!("{target} has no contents"),
        }
    }

    Ok(())
}

async fn run_data(global: &GlobalOptions, opts: DataOptions) -> Result<()> {
    let session = Session::open(global, Mode::ReadOnly)?;
    let source = session.read(global).await?;
    let data = source.template_data()?;

    let text = match opts.format {
        DataFormat::Json => serde_json::to_string_pretty(&data)? + "\n",
        DataFormat::Yaml => serde_yaml::to_string(&data)?,
    };
    print!("{text}");
    Ok(())
}

async fn run_execute_template(global: &GlobalOptions, opts: ExecuteTemplateOptions) -> Result<()> {
    let session = Session::open(global, Mode::ReadOnly)?;
    let source = session.read(global).await?;

    let mut templates = opts.templates;
    if templates.is_empty() {
        let mut input = String::new();
        io::stdin().read_to_string(&mut input)?;
        templates.push(input);
    }

    let mut stdout = io::stdout().lock();
    for (index, template) in templates.iter().enumerate() {
        let name = format!("arg{index}");
        let output = source.execute_template(&name, template.as_bytes())?;
        stdout.write_all(&output)?;
    }

    Ok(())
}

fn run_state_dump(global: &GlobalOptions) -> Result<()> {
    let session = Session::open(global, Mode::ReadOnly)?;

    let mut dump = BTreeMap::new();
    for bucket in Bucket::ALL {
        let mut values = BTreeMap::new();
        session.state.for_each(bucket, &mut |key, value| {
            let value = serde_json::from_slice(value)
                .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(value).into()));
            values.insert(String::from_utf8_lossy(key).into_owned(), value);
            Ok(())
        })?;
        dump.insert(bucket.name(), values);
    }

    println!("{}", serde_json::to_string_pretty(&dump)?);
    Ok(())
}

fn run_state_delete_bucket(global: &GlobalOptions, opts: DeleteBucketOptions) -> Result<()> {
    let session = Session::open(global, Mode::ReadWrite)?;
    session.state.delete_bucket(opts.bucket)?;
    info!("deleted bucket {}", opts.bucket);
    Ok(())
}
