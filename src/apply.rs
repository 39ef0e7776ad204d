// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Apply orchestration.
//!
//! Applying one target goes source entry, target entry, entry state, then a
//! comparison against what is at the destination and what was last written
//! there. Only then is the destination touched, through whatever [`System`]
//! the caller hands in. Dry runs, diffs, and status reports are all the same
//! walk over a different system or with a different pre-apply hook.
//!
//! # See Also
//!
//! - [`crate::target::TargetStateEntry::apply`]

use crate::{
    actual::ActualStateEntry,
    error::{Chain, Error, Result},
    filter::Filter,
    path::TargetRelPath,
    source::{SourceState, SourceStateEntry},
    state::{get_json, path_key, set_json, Bucket, EntryState, EntryStateKind, PersistentState},
    system::{self, mkdir_all, System},
    target::TargetStateEntry,
};

use inquire::Select;
use similar::TextDiff;
use std::{collections::BTreeSet, io};
use tracing::{debug, error, info, instrument};

/// Decision of a pre-apply hook.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PreApply {
    Proceed,
    Skip,
    Abort(i32),
}

/// What happened to a single target.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Entry type is not selected.
    Filtered,

    /// Destination already matched.
    NoOp,

    /// Bookkeeping or the pre-apply hook said to leave it be.
    Skipped,

    Applied,

    Aborted(i32),
}

/// Everything a pre-apply hook gets to look at.
pub struct PreApplyArgs<'a> {
    pub target: &'a TargetRelPath,
    pub target_state: &'a EntryState,
    pub last_written: Option<&'a EntryState>,
    pub actual_state: &'a EntryState,
    pub actual: &'a ActualStateEntry,
    pub target_entry: &'a TargetStateEntry,
}

/// Hook called right before a target is changed.
pub type PreApplyFn<'a> = Box<dyn FnMut(&PreApplyArgs<'_>) -> Result<PreApply> + 'a>;

/// Knobs of an apply.
pub struct ApplyOptions<'a> {
    pub filter: Filter,
    pub umask: u32,
    pub pre_apply: Option<PreApplyFn<'a>>,
}

impl Default for ApplyOptions<'_> {
    fn default() -> Self {
        Self {
            filter: Filter::default(),
            umask: 0o022,
            pre_apply: None,
        }
    }
}

/// Per-invocation switches of a command that applies.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyRequest {
    pub force: bool,
    pub interactive: bool,
    pub keep_going: bool,
    pub dry_run: bool,
    pub verbose: bool,
    pub filter: Filter,
}

impl ApplyRequest {
    /// Conflict policy matching these switches.
    pub fn conflict_policy(&self, can_prompt: bool) -> ConflictPolicy {
        ConflictPolicy::new(self.force, self.interactive, can_prompt)
    }
}

/// Tally of a whole apply.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub filtered: usize,
    pub aborted: Option<i32>,
}

impl SourceState {
    /// Bring one target in line with the source state.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Target`] wrapping whatever went wrong.
    #[instrument(level = "debug", skip(self, target_system, dest_system, state, options))]
    pub fn apply(
        &self,
        target_system: &dyn System,
        dest_system: &dyn System,
        state: &dyn PersistentState,
        target: &TargetRelPath,
        options: &mut ApplyOptions<'_>,
    ) -> Result<ApplyOutcome> {
        self.apply_target(target_system, dest_system, state, target, options)
            .map_err(Error::target(target))
    }

    fn apply_target(
        &self,
        target_system: &dyn System,
        dest_system: &dyn System,
        state: &dyn PersistentState,
        target: &TargetRelPath,
        options: &mut ApplyOptions<'_>,
    ) -> Result<ApplyOutcome> {
        let source_entry = self.must_entry(target)?;
        if !options.filter.includes(source_entry.entry_type()) {
            return Ok(ApplyOutcome::Filtered);
        }

        // INVARIANT: remove_ directories only go away after everything
        // inside them was applied.
        if matches!(source_entry, SourceStateEntry::Dir(dir) if dir.attr.remove) {
            return Ok(ApplyOutcome::NoOp);
        }

        let dest_path = target.to_abs(self.dest_dir());
        let target_entry = source_entry.target_state_entry(dest_system, &dest_path)?;
        if !options.filter.includes(target_entry.entry_type()) {
            return Ok(ApplyOutcome::Filtered);
        }

        let target_state = target_entry.entry_state(options.umask)?;
        if target_entry.skip_apply(state, &dest_path)? {
            debug!("skip {target}");
            return Ok(ApplyOutcome::Skipped);
        }

        let actual = ActualStateEntry::new(target_system, &dest_path)?;
        let actual_state = actual.entry_state();
        let key = path_key(&dest_path);
        let last_written: Option<EntryState> = get_json(state, Bucket::EntryState, &key)?;

        let always_runs = matches!(
            target_entry,
            TargetStateEntry::Script { .. } | TargetStateEntry::ModifyDirWithCmd { .. }
        );
        if !always_runs && target_state.same_as(&actual_state) {
            if !EntryState::equivalent(Some(&target_state), last_written.as_ref()) {
                set_json(state, Bucket::EntryState, &key, &target_state)?;
            }
            return Ok(ApplyOutcome::NoOp);
        }

        if let Some(pre_apply) = options.pre_apply.as_mut() {
            let args = PreApplyArgs {
                target,
                target_state: &target_state,
                last_written: last_written.as_ref(),
                actual_state: &actual_state,
                actual: &actual,
                target_entry: &target_entry,
            };
            match pre_apply(&args)? {
                PreApply::Proceed => {}
                PreApply::Skip => return Ok(ApplyOutcome::Skipped),
                PreApply::Abort(code) => return Ok(ApplyOutcome::Aborted(code)),
            }
        }

        let needs_parent = !matches!(
            target_entry,
            TargetStateEntry::Remove | TargetStateEntry::Script { .. }
        );
        if needs_parent {
            if let Some(parent) = dest_path.parent() {
                mkdir_all(target_system, parent, 0o777 & !options.umask)?;
            }
        }

        let change = target_entry.apply(target_system, &actual)?;
        if change.is_none() {
            return Ok(ApplyOutcome::NoOp);
        }

        change.commit(state, &dest_path, &target_state)?;
        info!("updated {target}");
        Ok(ApplyOutcome::Applied)
    }

    /// Remove `remove_` directories among `targets` that ended up empty.
    ///
    /// Deepest directories go first.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotADirectory`] if something other than a directory
    ///   sits at such a target.
    /// - Return [`Error`] if removal or bookkeeping fails.
    pub fn post_apply(
        &self,
        target_system: &dyn System,
        state: &dyn PersistentState,
        targets: &[TargetRelPath],
    ) -> Result<()> {
        let remove_dirs: BTreeSet<&TargetRelPath> = self.remove_dirs().collect();
        for target in targets.iter().rev().filter(|target| remove_dirs.contains(target)) {
            let path = target.to_abs(self.dest_dir());
            match target_system.lstat(&path) {
                Ok(info) if info.is_dir() => {}
                Ok(_) => return Err(Error::NotADirectory { path }),
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            }

            match target_system.remove(&path) {
                Ok(()) => debug!("removed empty {target}"),
                Err(err) if err.is_not_found() || is_not_empty(&err) => continue,
                Err(err) => return Err(err.into()),
            }

            set_json(state, Bucket::EntryState, &path_key(&path), &EntryState::remove())?;
        }

        Ok(())
    }

    /// Apply every target of `targets` in order, then run
    /// [`SourceState::post_apply`].
    ///
    /// With `keep_going`, a failing target is logged and the rest still run.
    ///
    /// # Errors
    ///
    /// - Return first target error without `keep_going`.
    /// - Return [`Error::KeptGoing`] with the number of failures with it.
    pub fn apply_all(
        &self,
        target_system: &dyn System,
        dest_system: &dyn System,
        state: &dyn PersistentState,
        targets: &[TargetRelPath],
        options: &mut ApplyOptions<'_>,
        keep_going: bool,
    ) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        let mut failures = 0;

        for target in targets {
            let outcome = match self.apply(target_system, dest_system, state, target, options) {
                Ok(outcome) => outcome,
                Err(err) if keep_going => {
                    error!("{}", Chain(&err));
                    failures += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            match outcome {
                ApplyOutcome::Filtered => report.filtered += 1,
                ApplyOutcome::NoOp => report.unchanged += 1,
                ApplyOutcome::Skipped => report.skipped += 1,
                ApplyOutcome::Applied => report.applied += 1,
                ApplyOutcome::Aborted(code) => {
                    report.aborted = Some(code);
                    return Ok(report);
                }
            }
        }

        self.post_apply(target_system, state, targets)?;
        if failures > 0 {
            return Err(Error::KeptGoing(failures));
        }

        Ok(report)
    }
}

fn is_not_empty(err: &system::Error) -> bool {
    match err {
        system::Error::Io { source, .. } => matches!(
            source.kind(),
            io::ErrorKind::DirectoryNotEmpty | io::ErrorKind::AlreadyExists
        ),
        _ => false,
    }
}

/// One-letter summary of how `to` differs from `from`.
///
/// A blank means no difference. Otherwise `D` is a removal, `R` a script
/// run, `A` an addition, and `M` anything else.
pub fn status_rune(from: Option<&EntryState>, to: &EntryState) -> char {
    let Some(from) = from else {
        return ' ';
    };
    if EntryState::equivalent(Some(from), Some(to)) {
        return ' ';
    }

    match (from.kind, to.kind) {
        (_, EntryStateKind::Remove) => 'D',
        (_, EntryStateKind::Script) => 'R',
        (EntryStateKind::Remove, _) => 'A',
        _ => 'M',
    }
}

/// Two-column status line of a target, or nothing when it is settled.
///
/// The first column compares what was last written with what is there now,
/// the second compares what is there now with what should be there.
pub fn status_line(args: &PreApplyArgs<'_>) -> Option<String> {
    let x = if EntryState::equivalent(args.last_written, Some(args.actual_state)) {
        ' '
    } else {
        status_rune(args.last_written, args.actual_state)
    };
    let y = status_rune(Some(args.actual_state), args.target_state);

    (x != ' ' || y != ' ').then(|| format!("{x}{y} {}", args.target))
}

/// Default conflict handling of the apply command.
///
/// Overwrites freely when the destination still holds what was last written
/// there. Otherwise the user is asked, unless forced.
#[derive(Clone, Debug, Default)]
pub struct ConflictPolicy {
    force: bool,
    interactive: bool,
    can_prompt: bool,
    overwrite_all: bool,
}

const CHOICE_DIFF: &str = "diff";
const CHOICE_OVERWRITE: &str = "overwrite";
const CHOICE_ALL: &str = "all-overwrite";
const CHOICE_SKIP: &str = "skip";
const CHOICE_QUIT: &str = "quit";

impl ConflictPolicy {
    /// Construct new policy.
    ///
    /// Without `can_prompt`, a conflict that would need a question becomes
    /// [`Error::Conflict`].
    pub fn new(force: bool, interactive: bool, can_prompt: bool) -> Self {
        Self {
            force,
            interactive,
            can_prompt,
            overwrite_all: false,
        }
    }

    /// Decide what to do about one target.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Conflict`] if asking is not possible.
    /// - Return [`Error::Prompt`] if the prompt fails.
    pub fn pre_apply(&mut self, args: &PreApplyArgs<'_>) -> Result<PreApply> {
        if args.target_state.overwrite || self.force || self.overwrite_all {
            return Ok(PreApply::Proceed);
        }
        if args.target_state.kind == EntryStateKind::Script && !self.interactive {
            return Ok(PreApply::Proceed);
        }

        let unchanged = args.last_written.is_none()
            || EntryState::equivalent(args.last_written, Some(args.actual_state));
        if unchanged && !self.interactive {
            return Ok(PreApply::Proceed);
        }
        if !self.can_prompt {
            return Err(Error::Conflict(args.target.clone()));
        }

        let message = if unchanged {
            format!("Apply {}?", args.target)
        } else {
            format!("{} has changed since chezmoi last wrote it?", args.target)
        };
        let overwrite = if unchanged { "apply" } else { CHOICE_OVERWRITE };

        loop {
            let choice = Select::new(
                &message,
                vec![CHOICE_DIFF, overwrite, CHOICE_ALL, CHOICE_SKIP, CHOICE_QUIT],
            )
            .prompt()
            .map_err(|source| Error::Prompt {
                target: args.target.clone(),
                source,
            })?;

            match choice {
                CHOICE_DIFF => eprint!("{}", diff(args)?),
                CHOICE_ALL => {
                    self.overwrite_all = true;
                    return Ok(PreApply::Proceed);
                }
                CHOICE_SKIP => return Ok(PreApply::Skip),
                CHOICE_QUIT => return Ok(PreApply::Abort(0)),
                _ => return Ok(PreApply::Proceed),
            }
        }
    }
}

/// Pre-apply hook deciding conflicts through `policy`.
pub fn default_pre_apply(policy: &mut ConflictPolicy) -> PreApplyFn<'_> {
    Box::new(move |args: &PreApplyArgs<'_>| policy.pre_apply(args))
}

/// Unified diff between what is at the destination and what would be
/// written there.
///
/// # Errors
///
/// - Return [`Error`] if target contents fail to compute.
pub fn diff(args: &PreApplyArgs<'_>) -> Result<String> {
    let before = match args.actual {
        ActualStateEntry::File { contents, .. } => String::from_utf8_lossy(contents).into_owned(),
        ActualStateEntry::Symlink { linkname, .. } => format!("{linkname}\n"),
        _ => String::new(),
    };
    let after = args
        .target_entry
        .contents()?
        .map(|contents| String::from_utf8_lossy(&contents).into_owned())
        .unwrap_or_default();

    let name = args.target.to_string();
    Ok(TextDiff::from_lines(&before, &after)
        .unified_diff()
        .header(&format!("a/{name}"), &format!("b/{name}"))
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::EntryTypeSet,
        source::ReadOptions,
        state::MemoryState,
        system::{DryRunSystem, RealSystem},
    };
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::{fs, path::Path, sync::Arc};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        source: TempDir,
        dest: TempDir,
        system: Arc<RealSystem>,
        state: MemoryState,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                source: TempDir::new().unwrap(),
                dest: TempDir::new().unwrap(),
                system: Arc::new(RealSystem::new()),
                state: MemoryState::new(),
            }
        }

        fn source_file(&self, rel: &str, contents: &str) -> &Self {
            let path = self.source.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
            self
        }

        fn dest(&self, rel: &str) -> std::path::PathBuf {
            self.dest.path().join(rel)
        }

        async fn source_state(&self) -> SourceState {
            let mut source =
                SourceState::new(self.system.clone(), self.source.path(), self.dest.path());
            source
                .read(&CancellationToken::new(), &ReadOptions::default())
                .await
                .unwrap();
            source
        }

        fn apply_all(
            &self,
            source: &SourceState,
            system: &dyn System,
            options: &mut ApplyOptions<'_>,
        ) -> Result<ApplyReport> {
            source.apply_all(
                system,
                self.system.as_ref(),
                &self.state,
                &source.target_rel_paths(),
                options,
                false,
            )
        }
    }

    #[tokio::test]
    async fn apply_then_nothing_left_to_do() {
        let fixture = Fixture::new();
        fixture
            .source_file("dot_bashrc", "alias ll='ls -l'\n")
            .source_file("dot_config/git/config", "[user]\n");
        let source = fixture.source_state().await;

        let report = fixture
            .apply_all(&source, fixture.system.as_ref(), &mut ApplyOptions::default())
            .unwrap();
        assert_eq!(report.applied, 4);
        assert_eq!(
            fs::read_to_string(fixture.dest(".config/git/config")).unwrap(),
            "[user]\n"
        );

        let again = fixture
            .apply_all(&source, fixture.system.as_ref(), &mut ApplyOptions::default())
            .unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.unchanged, 4);
    }

    #[tokio::test]
    async fn dry_run_leaves_destination_alone() {
        let fixture = Fixture::new();
        fixture.source_file("dot_profile", "export A=1\n");
        let source = fixture.source_state().await;

        let dry_run = DryRunSystem::new(fixture.system.clone());
        fixture
            .apply_all(&source, &dry_run, &mut ApplyOptions::default())
            .unwrap();
        assert!(dry_run.modified());
        assert!(!fixture.dest(".profile").exists());
    }

    #[tokio::test]
    async fn filter_keeps_entry_types_out() {
        let fixture = Fixture::new();
        fixture
            .source_file("dot_a", "a\n")
            .source_file("symlink_dot_b", "a\n");
        let source = fixture.source_state().await;

        let mut options = ApplyOptions {
            filter: Filter::new(EntryTypeSet::ALL, EntryTypeSet::SYMLINKS),
            ..Default::default()
        };
        let report = fixture
            .apply_all(&source, fixture.system.as_ref(), &mut options)
            .unwrap();
        assert_eq!(report.filtered, 1);
        assert!(fs::symlink_metadata(fixture.dest(".b")).is_err());
    }

    #[tokio::test]
    async fn changed_destination_is_a_conflict() {
        let fixture = Fixture::new();
        fixture.source_file("dot_a", "one\n");
        let source = fixture.source_state().await;
        fixture
            .apply_all(&source, fixture.system.as_ref(), &mut ApplyOptions::default())
            .unwrap();

        fs::write(fixture.dest(".a"), "edited\n").unwrap();
        fixture.source_file("dot_a", "two\n");
        let source = fixture.source_state().await;

        let mut policy = ConflictPolicy::new(false, false, false);
        let mut options = ApplyOptions {
            pre_apply: Some(default_pre_apply(&mut policy)),
            ..Default::default()
        };
        let result = fixture.apply_all(&source, fixture.system.as_ref(), &mut options);
        assert!(
            matches!(&result, Err(Error::Target { source, .. }) if matches!(**source, Error::Conflict(_))),
            "{result:?}"
        );
        assert_eq!(fs::read_to_string(fixture.dest(".a")).unwrap(), "edited\n");
    }

    #[tokio::test]
    async fn status_skips_and_reports() {
        let fixture = Fixture::new();
        fixture.source_file("dot_a", "a\n").source_file("dot_b", "b\n");
        fs::write(fixture.dest(".b"), "b\n").unwrap();
        let source = fixture.source_state().await;

        let mut lines = Vec::new();
        let mut options = ApplyOptions {
            pre_apply: Some(Box::new(|args: &PreApplyArgs<'_>| {
                lines.extend(status_line(args));
                Ok(PreApply::Skip)
            })),
            ..Default::default()
        };
        let dry_run = DryRunSystem::new(fixture.system.clone());
        fixture.apply_all(&source, &dry_run, &mut options).unwrap();
        drop(options);

        assert_eq!(lines, vec![" A .a"]);
    }

    #[tokio::test]
    async fn keep_going_counts_failures() {
        let fixture = Fixture::new();
        fixture
            .source_file("dot_bad.tmpl", "{{ nope( }}\n")
            .source_file("dot_good", "ok\n");
        let source = fixture.source_state().await;

        let result = source.apply_all(
            fixture.system.as_ref(),
            fixture.system.as_ref(),
            &fixture.state,
            &source.target_rel_paths(),
            &mut ApplyOptions::default(),
            true,
        );
        assert!(matches!(result, Err(Error::KeptGoing(1))), "{result:?}");
        assert_eq!(fs::read_to_string(fixture.dest(".good")).unwrap(), "ok\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn remove_dir_goes_once_empty() {
        let fixture = Fixture::new();
        fixture.source_file("remove_dot_old/remove_junk", "");
        fs::create_dir_all(fixture.dest(".old")).unwrap();
        fs::write(fixture.dest(".old/junk"), "x").unwrap();
        let source = fixture.source_state().await;

        fixture
            .apply_all(&source, fixture.system.as_ref(), &mut ApplyOptions::default())
            .unwrap();
        assert!(!Path::new(&fixture.dest(".old")).exists());
    }

    #[rstest]
    #[case(None, EntryStateKind::File, ' ')]
    #[case(Some(EntryStateKind::Remove), EntryStateKind::File, 'A')]
    #[case(Some(EntryStateKind::File), EntryStateKind::Remove, 'D')]
    #[case(Some(EntryStateKind::Remove), EntryStateKind::Script, 'R')]
    #[case(Some(EntryStateKind::Dir), EntryStateKind::File, 'M')]
    fn runes(#[case] from: Option<EntryStateKind>, #[case] to: EntryStateKind, #[case] expect: char) {
        let from = from.map(|kind| EntryState::new(kind, 0, None));
        let to = EntryState::new(to, 0, None);
        assert_eq!(status_rune(from.as_ref(), &to), expect);
    }
}
