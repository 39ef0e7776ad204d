// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::path::TargetRelPath;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

/// Set of include and exclude glob patterns over target paths.
///
/// Patterns are read line by line from pattern files. Each pattern is
/// anchored at the directory that holds its file. A leading `!` turns the
/// pattern into an exclusion, and exclusions always win over inclusions no
/// matter the order they were given in.
#[derive(Debug, Clone)]
pub struct PatternSet {
    includes: Vec<String>,
    excludes: Vec<String>,
    include: Gitignore,
    exclude: Gitignore,
}

impl Default for PatternSet {
    fn default() -> Self {
        Self {
            includes: Vec::new(),
            excludes: Vec::new(),
            include: Gitignore::empty(),
            exclude: Gitignore::empty(),
        }
    }
}

impl PatternSet {
    /// Construct new empty pattern set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every pattern of a pattern file found in `dir`.
    ///
    /// Blank lines are skipped, and `#` starts a comment.
    ///
    /// # Errors
    ///
    /// - Return [`ignore::Error`] if a pattern is not a valid glob.
    pub fn add_lines(&mut self, dir: &TargetRelPath, text: &str) -> Result<(), ignore::Error> {
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            match line.strip_prefix('!') {
                Some(pattern) => self.excludes.push(anchor(dir, pattern)),
                None => self.includes.push(anchor(dir, line)),
            }
        }

        self.include = compile(&self.includes)?;
        self.exclude = compile(&self.excludes)?;
        Ok(())
    }

    /// Check if path or any of its ancestors is included and not excluded.
    pub fn matches(&self, path: &TargetRelPath) -> bool {
        if path.is_empty() {
            return false;
        }

        matched(&self.include, path.as_path()) && !self.is_excluded(path.as_path())
    }

    /// Check if path or any of its ancestors is excluded.
    pub fn is_excluded(&self, path: &Path) -> bool {
        matched(&self.exclude, path)
    }

    /// Anchored include patterns, without their leading `/`.
    pub fn include_patterns(&self) -> impl Iterator<Item = &str> {
        self.includes.iter().map(|pattern| pattern.trim_start_matches('/'))
    }

    /// Check if no patterns were added.
    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }
}

fn anchor(dir: &TargetRelPath, pattern: &str) -> String {
    let pattern = pattern.trim_matches('/');
    if dir.is_empty() {
        format!("/{pattern}")
    } else {
        format!("/{}/{pattern}", dir.as_path().to_string_lossy())
    }
}

fn compile(patterns: &[String]) -> Result<Gitignore, ignore::Error> {
    let mut builder = GitignoreBuilder::new(".");
    for pattern in patterns {
        builder.add_line(None, pattern)?;
    }

    builder.build()
}

fn matched(matcher: &Gitignore, path: &Path) -> bool {
    matcher.matched_path_or_any_parents(path, false).is_ignore()
}
