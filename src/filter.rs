// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Entry type filtering.
//!
//! Commands like `apply --exclude scripts` or `diff --include files` narrow
//! the set of entries they touch by entry type. A [`Filter`] combines an
//! include set with an exclude set, where exclusion always wins.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    ops::{BitAnd, BitOr, Not},
    str::FromStr,
};

/// Bitset over entry types.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct EntryTypeSet(u16);

impl EntryTypeSet {
    pub const NONE: Self = Self(0);
    pub const DIRS: Self = Self(1 << 0);
    pub const FILES: Self = Self(1 << 1);
    pub const REMOVE: Self = Self(1 << 2);
    pub const SCRIPTS: Self = Self(1 << 3);
    pub const SYMLINKS: Self = Self(1 << 4);
    pub const ENCRYPTED: Self = Self(1 << 5);
    pub const EXTERNALS: Self = Self(1 << 6);
    pub const TEMPLATES: Self = Self(1 << 7);
    pub const ALWAYS: Self = Self(1 << 8);
    pub const ALL: Self = Self((1 << 9) - 1);

    const NAMES: &'static [(&'static str, Self)] = &[
        ("all", Self::ALL),
        ("none", Self::NONE),
        ("dirs", Self::DIRS),
        ("files", Self::FILES),
        ("remove", Self::REMOVE),
        ("scripts", Self::SCRIPTS),
        ("symlinks", Self::SYMLINKS),
        ("encrypted", Self::ENCRYPTED),
        ("externals", Self::EXTERNALS),
        ("templates", Self::TEMPLATES),
        ("always", Self::ALWAYS),
    ];

    /// Check if every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if any bit of `other` is set.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Check if no bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EntryTypeSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for EntryTypeSet {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for EntryTypeSet {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }
}

/// Parse a comma separated list of type names.
///
/// A `no` prefix removes a type, so `all,noscripts` selects everything except
/// scripts. Names are processed left to right.
impl FromStr for EntryTypeSet {
    type Err = UnknownEntryType;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut set = Self::NONE;
        for word in data.split(',').map(str::trim).filter(|word| !word.is_empty()) {
            let (negated, name) = match word.strip_prefix("no") {
                Some(name) if name != "ne" => (true, name),
                _ => (false, word),
            };

            let bits = Self::NAMES
                .iter()
                .find(|(known, _)| *known == name)
                .map(|(_, bits)| *bits)
                .ok_or_else(|| UnknownEntryType(word.to_string()))?;

            set = if negated { set & !bits } else { set | bits };
        }

        Ok(set)
    }
}

impl Display for EntryTypeSet {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        if *self == Self::ALL {
            return fmt.write_str("all");
        }
        if self.is_empty() {
            return fmt.write_str("none");
        }

        let names: Vec<&str> = Self::NAMES[2..]
            .iter()
            .filter(|(_, bits)| self.contains(*bits))
            .map(|(name, _)| *name)
            .collect();
        fmt.write_str(&names.join(","))
    }
}

/// Entry type name not understood.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown entry type {0:?}")]
pub struct UnknownEntryType(pub String);

/// Include/exclude entry type filter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    include: EntryTypeSet,
    exclude: EntryTypeSet,
}

impl Default for Filter {
    fn default() -> Self {
        Self::new(EntryTypeSet::ALL, EntryTypeSet::NONE)
    }
}

impl Filter {
    /// Construct new filter.
    pub fn new(include: EntryTypeSet, exclude: EntryTypeSet) -> Self {
        Self { include, exclude }
    }

    /// Check if entries carrying `bits` pass the filter.
    ///
    /// Some bit must be included, and none may be excluded.
    pub fn includes(&self, bits: EntryTypeSet) -> bool {
        self.include.intersects(bits) && !self.exclude.intersects(bits)
    }

    /// Filter that lets through everything this one does, minus `bits`.
    pub fn excluding(mut self, bits: EntryTypeSet) -> Self {
        self.exclude = self.exclude | bits;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("all", EntryTypeSet::ALL)]
    #[case("none", EntryTypeSet::NONE)]
    #[case("files,dirs", EntryTypeSet::FILES | EntryTypeSet::DIRS)]
    #[case("all,noscripts", !EntryTypeSet::SCRIPTS)]
    #[case(" symlinks , templates ", EntryTypeSet::SYMLINKS | EntryTypeSet::TEMPLATES)]
    #[case("", EntryTypeSet::NONE)]
    fn entry_type_set_from_str(#[case] input: &str, #[case] expect: EntryTypeSet) {
        assert_eq!(input.parse::<EntryTypeSet>(), Ok(expect));
    }

    #[test]
    fn entry_type_set_rejects_unknown() {
        assert_eq!(
            "files,bogus".parse::<EntryTypeSet>(),
            Err(UnknownEntryType("bogus".into()))
        );
    }

    #[test]
    fn entry_type_set_display() {
        assert_eq!(EntryTypeSet::ALL.to_string(), "all");
        assert_eq!((EntryTypeSet::FILES | EntryTypeSet::SCRIPTS).to_string(), "files,scripts");
    }

    #[test]
    fn filter_exclude_wins() {
        let filter = Filter::new(EntryTypeSet::FILES | EntryTypeSet::SCRIPTS, EntryTypeSet::SCRIPTS);
        assert!(filter.includes(EntryTypeSet::FILES));
        assert!(!filter.includes(EntryTypeSet::SCRIPTS));
        assert!(!filter.includes(EntryTypeSet::DIRS));
        assert!(!filter.includes(EntryTypeSet::FILES | EntryTypeSet::SCRIPTS));
        assert!(filter.includes(EntryTypeSet::FILES | EntryTypeSet::TEMPLATES));

        let filter = Filter::default().excluding(EntryTypeSet::ENCRYPTED);
        assert!(filter.includes(EntryTypeSet::FILES | EntryTypeSet::TEMPLATES));
        assert!(!filter.includes(EntryTypeSet::FILES | EntryTypeSet::ENCRYPTED));
    }
}
