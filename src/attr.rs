// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Source name attribute codec.
//!
//! Every component of a path inside the source directory encodes how the
//! matching destination entry should look. The encoding is a run of prefix
//! tokens, a base name, and an optional run of suffix tokens:
//!
//! ```text
//! private_executable_dot_local.tmpl
//! ^^^^^^^^ ^^^^^^^^^^^ ^^^^^^^^^ ^^^^
//! modifier modifier   name      suffix
//! ```
//!
//! # Tokenizer
//!
//! Decoding is split into two passes. The tokenizer greedily strips prefix
//! tokens found in a fixed token table until it reaches a component that is
//! not a token, or a name marker (`dot_` or `literal_`) that ends prefix
//! interpretation for the rest of the component. The grammar pass then
//! checks the token sequence against the rules of the entry type: at most
//! one type marker, which must come first, modifiers in their canonical
//! order, no duplicates, and no mutually exclusive pairs.
//!
//! A leading segment that is almost a token, like `privte_` or `exectuable_`,
//! is rejected instead of being accepted as part of a literal name. Names
//! that genuinely begin like a token are spelled with the `literal_` escape,
//! which [`FileAttr::source_name`] and [`DirAttr::source_name`] insert
//! automatically.
//!
//! # Suffixes
//!
//! Files may end with the encryption suffix (only when `encrypted_` is set),
//! then `.tmpl`. A `.literal` suffix protects target names that themselves
//! end in `.tmpl` or `.literal`.

use std::fmt::{Display, Formatter, Result as FmtResult};

/// Marks a template.
pub const TEMPLATE_SUFFIX: &str = ".tmpl";

/// Escapes a trailing suffix.
pub const LITERAL_SUFFIX: &str = ".literal";

/// Prefix token understood by the codec.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    Create,
    Modify,
    Remove,
    Run,
    Symlink,
    Once,
    OnChange,
    Before,
    After,
    External,
    Exact,
    Encrypted,
    Private,
    ReadOnly,
    Empty,
    Executable,
    Dot,
    Literal,
}

impl Token {
    /// Encoded spelling of token.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Create => "create_",
            Self::Modify => "modify_",
            Self::Remove => "remove_",
            Self::Run => "run_",
            Self::Symlink => "symlink_",
            Self::Once => "once_",
            Self::OnChange => "onchange_",
            Self::Before => "before_",
            Self::After => "after_",
            Self::External => "external_",
            Self::Exact => "exact_",
            Self::Encrypted => "encrypted_",
            Self::Private => "private_",
            Self::ReadOnly => "readonly_",
            Self::Empty => "empty_",
            Self::Executable => "executable_",
            Self::Dot => "dot_",
            Self::Literal => "literal_",
        }
    }

    fn stem(self) -> &'static str {
        self.prefix().trim_end_matches('_')
    }

    fn is_file_type(self) -> bool {
        matches!(
            self,
            Self::Create | Self::Modify | Self::Remove | Self::Run | Self::Symlink
        )
    }

    fn is_script_only(self) -> bool {
        matches!(self, Self::Once | Self::OnChange | Self::Before | Self::After)
    }
}

impl Display for Token {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.prefix())
    }
}

// INVARIANT: No entry is a prefix of another, so table order never decides
// between two overlapping matches.
const FILE_TOKENS: &[Token] = &[
    Token::Create,
    Token::Modify,
    Token::Remove,
    Token::Run,
    Token::Symlink,
    Token::Once,
    Token::OnChange,
    Token::Before,
    Token::After,
    Token::Encrypted,
    Token::Private,
    Token::ReadOnly,
    Token::Empty,
    Token::Executable,
    Token::Dot,
    Token::Literal,
];

const DIR_TOKENS: &[Token] = &[
    Token::Remove,
    Token::External,
    Token::Exact,
    Token::Private,
    Token::ReadOnly,
    Token::Dot,
    Token::Literal,
];

// Slots hold tokens in canonical order. Tokens sharing a slot exclude each
// other.
const FILE_SLOTS: &[&[Token]] = &[
    &[Token::Encrypted],
    &[Token::Private],
    &[Token::ReadOnly],
    &[Token::Empty],
    &[Token::Executable],
];
const CREATE_SLOTS: &[&[Token]] = &[
    &[Token::Encrypted],
    &[Token::Private],
    &[Token::ReadOnly],
    &[Token::Executable],
];
const MODIFY_SLOTS: &[&[Token]] = CREATE_SLOTS;
const SCRIPT_SLOTS: &[&[Token]] = &[
    &[Token::Once, Token::OnChange],
    &[Token::Before, Token::After],
];
const DIR_SLOTS: &[&[Token]] = &[
    &[Token::External],
    &[Token::Exact],
    &[Token::Private],
    &[Token::ReadOnly],
];

// Shorter stems collide with too many ordinary words to be worth guarding.
const NEAR_MISS_MIN_LEN: usize = 6;

/// Kind of entry a source file produces.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SourceFileKind {
    #[default]
    File,
    Create,
    Modify,
    Remove,
    Script,
    Symlink,
}

impl SourceFileKind {
    fn from_token(token: Token) -> Option<Self> {
        match token {
            Token::Create => Some(Self::Create),
            Token::Modify => Some(Self::Modify),
            Token::Remove => Some(Self::Remove),
            Token::Run => Some(Self::Script),
            Token::Symlink => Some(Self::Symlink),
            _ => None,
        }
    }

    fn token(self) -> Option<Token> {
        match self {
            Self::File => None,
            Self::Create => Some(Token::Create),
            Self::Modify => Some(Token::Modify),
            Self::Remove => Some(Token::Remove),
            Self::Script => Some(Token::Run),
            Self::Symlink => Some(Token::Symlink),
        }
    }

    fn slots(self) -> &'static [&'static [Token]] {
        match self {
            Self::File => FILE_SLOTS,
            Self::Create => CREATE_SLOTS,
            Self::Modify => MODIFY_SLOTS,
            Self::Script => SCRIPT_SLOTS,
            Self::Remove | Self::Symlink => &[],
        }
    }

    /// Human readable name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Remove => "remove",
            Self::Script => "script",
            Self::Symlink => "symlink",
        }
    }
}

/// When a script is allowed to run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ScriptCondition {
    #[default]
    Always,
    Once,
    OnChange,
}

/// Where a script runs relative to the rest of an apply.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScriptOrder {
    Before,
    #[default]
    During,
    After,
}

/// Attributes decoded from a source directory name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DirAttr {
    pub target_name: String,
    pub remove: bool,
    pub external: bool,
    pub exact: bool,
    pub private: bool,
    pub readonly: bool,
}

impl DirAttr {
    /// Construct attributes for a plain directory.
    pub fn new(target_name: impl Into<String>) -> Self {
        Self {
            target_name: target_name.into(),
            ..Default::default()
        }
    }

    /// Decode a source directory name.
    ///
    /// # Errors
    ///
    /// - Return [`InvalidAttributesError`] if tokens conflict, repeat, are
    ///   out of order, or look like a misspelled token.
    pub fn parse(source_name: &str) -> Result<Self> {
        let scan = tokenize(source_name, DIR_TOKENS)?;
        let mut attr = DirAttr::new(scan.name);

        let (remove, modifiers) = match scan.tokens.split_first() {
            Some((Token::Remove, rest)) => (true, rest),
            _ => (false, scan.tokens.as_slice()),
        };

        if remove {
            if let Some(token) = modifiers.first() {
                return Err(InvalidAttributesError::new(
                    source_name,
                    Reason::NotAllowed {
                        token: *token,
                        kind: "remove directory",
                    },
                ));
            }
            attr.remove = true;
        }

        for token in check_slots(source_name, modifiers, DIR_SLOTS, None)? {
            match token {
                Token::External => attr.external = true,
                Token::Exact => attr.exact = true,
                Token::Private => attr.private = true,
                Token::ReadOnly => attr.readonly = true,
                _ => unreachable!("directory slots only hold directory modifiers"),
            }
        }

        check_name(source_name, &attr.target_name)?;
        Ok(attr)
    }

    /// Encode attributes back into a source directory name.
    ///
    /// A removed directory carries no other attributes, so they are dropped.
    pub fn source_name(&self) -> String {
        let mut name = String::new();
        if self.remove {
            name.push_str(Token::Remove.prefix());
        } else {
            for (set, token) in [
                (self.external, Token::External),
                (self.exact, Token::Exact),
                (self.private, Token::Private),
                (self.readonly, Token::ReadOnly),
            ] {
                if set {
                    name.push_str(token.prefix());
                }
            }
        }

        push_escaped_name(&mut name, &self.target_name, DIR_TOKENS);
        name
    }

    /// Permission bits before the umask is applied.
    pub fn perm(&self) -> u32 {
        let mut perm = 0o777;
        if self.private {
            perm &= !0o077;
        }
        if self.readonly {
            perm &= !0o222;
        }
        perm
    }
}

/// Attributes decoded from a source file name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FileAttr {
    pub target_name: String,
    pub kind: SourceFileKind,
    pub condition: ScriptCondition,
    pub order: ScriptOrder,
    pub encrypted: bool,
    pub private: bool,
    pub readonly: bool,
    pub empty: bool,
    pub executable: bool,
    pub template: bool,
}

impl FileAttr {
    /// Construct attributes for a plain file of given kind.
    pub fn new(target_name: impl Into<String>, kind: SourceFileKind) -> Self {
        Self {
            target_name: target_name.into(),
            kind,
            ..Default::default()
        }
    }

    /// Decode a source file name.
    ///
    /// The encryption suffix is only stripped when the `encrypted_` token is
    /// present.
    ///
    /// # Errors
    ///
    /// - Return [`InvalidAttributesError`] if tokens conflict, repeat, are
    ///   out of order, are not allowed for the file kind, or look like a
    ///   misspelled token.
    pub fn parse(source_name: &str, encrypted_suffix: &str) -> Result<Self> {
        let scan = tokenize(source_name, FILE_TOKENS)?;

        let (kind, modifiers) = match scan.tokens.split_first() {
            Some((first, rest)) if first.is_file_type() => {
                (SourceFileKind::from_token(*first).unwrap_or_default(), rest)
            }
            _ => (SourceFileKind::File, scan.tokens.as_slice()),
        };

        let mut attr = FileAttr::new(String::new(), kind);
        let type_token = kind.token();
        for token in check_slots(source_name, modifiers, kind.slots(), type_token)? {
            match token {
                Token::Encrypted => attr.encrypted = true,
                Token::Private => attr.private = true,
                Token::ReadOnly => attr.readonly = true,
                Token::Empty => attr.empty = true,
                Token::Executable => attr.executable = true,
                Token::Once => attr.condition = ScriptCondition::Once,
                Token::OnChange => attr.condition = ScriptCondition::OnChange,
                Token::Before => attr.order = ScriptOrder::Before,
                Token::After => attr.order = ScriptOrder::After,
                _ => unreachable!("file slots only hold file modifiers"),
            }
        }

        let mut name = scan.name.as_str();
        if attr.encrypted && !encrypted_suffix.is_empty() {
            name = name.strip_suffix(encrypted_suffix).unwrap_or(name);
        }

        if let Some(stripped) = name.strip_suffix(LITERAL_SUFFIX) {
            name = stripped;
        } else if let Some(stripped) = name.strip_suffix(TEMPLATE_SUFFIX) {
            attr.template = true;
            name = stripped.strip_suffix(LITERAL_SUFFIX).unwrap_or(stripped);
        }

        check_name(source_name, name)?;
        attr.target_name = name.to_string();
        Ok(attr)
    }

    /// Encode attributes back into a source file name.
    ///
    /// Flags that have no meaning for the file kind are not encoded.
    pub fn source_name(&self, encrypted_suffix: &str) -> String {
        let mut name = String::new();
        if let Some(token) = self.kind.token() {
            name.push_str(token.prefix());
        }

        let flags = [
            (self.encrypted, Token::Encrypted),
            (self.private, Token::Private),
            (self.readonly, Token::ReadOnly),
            (self.empty, Token::Empty),
            (self.executable, Token::Executable),
            (self.condition == ScriptCondition::Once, Token::Once),
            (self.condition == ScriptCondition::OnChange, Token::OnChange),
            (self.order == ScriptOrder::Before, Token::Before),
            (self.order == ScriptOrder::After, Token::After),
        ];
        let slots = self.kind.slots();
        for (set, token) in flags {
            if set && slots.iter().any(|slot| slot.contains(&token)) {
                name.push_str(token.prefix());
            }
        }

        push_escaped_name(&mut name, &self.target_name, FILE_TOKENS);

        if self.target_name.ends_with(LITERAL_SUFFIX) || self.target_name.ends_with(TEMPLATE_SUFFIX)
        {
            name.push_str(LITERAL_SUFFIX);
        }
        if self.template {
            name.push_str(TEMPLATE_SUFFIX);
        }
        if self.is_encrypted() {
            name.push_str(encrypted_suffix);
        }

        name
    }

    /// Check if contents are stored encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted && self.kind.slots().iter().any(|slot| slot.contains(&Token::Encrypted))
    }

    /// Permission bits before the umask is applied.
    pub fn perm(&self) -> u32 {
        let mut perm = 0o666;
        if self.executable {
            perm |= 0o111;
        }
        if self.private {
            perm &= !0o077;
        }
        if self.readonly {
            perm &= !0o222;
        }
        perm
    }
}

struct Scan {
    tokens: Vec<Token>,
    name: String,
}

fn tokenize(source_name: &str, table: &[Token]) -> Result<Scan> {
    let mut tokens = Vec::new();
    let mut rest = source_name;

    loop {
        let Some(token) = allowed(table, &tokens).find(|t| rest.starts_with(t.prefix())) else {
            break;
        };
        rest = &rest[token.prefix().len()..];

        match token {
            Token::Dot => {
                return Ok(Scan {
                    tokens,
                    name: format!(".{rest}"),
                })
            }
            Token::Literal => {
                return Ok(Scan {
                    tokens,
                    name: rest.to_string(),
                })
            }
            _ => tokens.push(token),
        }
    }

    let candidates: Vec<Token> = allowed(table, &tokens).collect();
    if let Some(expected) = near_miss(rest, &candidates) {
        let found = rest.split('_').next().unwrap_or_default().to_string();
        return Err(InvalidAttributesError::new(
            source_name,
            Reason::NearMiss { found, expected },
        ));
    }

    Ok(Scan {
        tokens,
        name: rest.to_string(),
    })
}

// Script modifiers only mean something after `run_`.
fn allowed<'a>(table: &'a [Token], seen: &[Token]) -> impl Iterator<Item = Token> + 'a {
    let script = seen.first() == Some(&Token::Run);
    table
        .iter()
        .copied()
        .filter(move |token| script || !token.is_script_only())
}

fn check_slots(
    source_name: &str,
    modifiers: &[Token],
    slots: &[&[Token]],
    type_token: Option<Token>,
) -> Result<Vec<Token>> {
    let kind = match type_token {
        Some(Token::Create) => "create file",
        Some(Token::Modify) => "modify file",
        Some(Token::Remove) => "remove file",
        Some(Token::Run) => "script",
        Some(Token::Symlink) => "symlink",
        _ if slots == DIR_SLOTS => "directory",
        _ => "file",
    };
    let fail = |reason| Err(InvalidAttributesError::new(source_name, reason));

    let mut seen: Vec<Token> = Vec::new();
    let mut next_slot = 0;
    for &token in modifiers {
        if seen.contains(&token) || Some(token) == type_token {
            return fail(Reason::Duplicate(token));
        }

        if token.is_file_type() {
            return match type_token {
                Some(first) => fail(Reason::Conflict {
                    first,
                    second: token,
                }),
                None => fail(Reason::Misplaced {
                    token,
                    after: seen.last().copied().unwrap_or(token),
                }),
            };
        }

        let Some(index) = slots.iter().position(|slot| slot.contains(&token)) else {
            return fail(Reason::NotAllowed { token, kind });
        };

        if index < next_slot {
            if let Some(first) = slots[index].iter().copied().find(|t| seen.contains(t)) {
                return fail(Reason::Conflict {
                    first,
                    second: token,
                });
            }

            let after = seen.last().copied().unwrap_or(token);
            return fail(Reason::Misplaced { token, after });
        }

        next_slot = index + 1;
        seen.push(token);
    }

    Ok(seen)
}

fn check_name(source_name: &str, name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(InvalidAttributesError::new(
            source_name,
            Reason::InvalidName(name.to_string()),
        ));
    }

    Ok(())
}

fn push_escaped_name(out: &mut String, target_name: &str, table: &[Token]) {
    if let Some(rest) = target_name.strip_prefix('.') {
        out.push_str(Token::Dot.prefix());
        out.push_str(rest);
    } else if table.iter().any(|t| target_name.starts_with(t.prefix()))
        || near_miss(target_name, table).is_some()
    {
        out.push_str(Token::Literal.prefix());
        out.push_str(target_name);
    } else {
        out.push_str(target_name);
    }
}

/// Find token that the leading segment of `rest` is a typo of.
///
/// A typo is one missing character or one swap of adjacent characters.
/// One extra character is not a typo, so `removed_items` stays a name.
fn near_miss(rest: &str, table: &[Token]) -> Option<Token> {
    let (segment, _) = rest.split_once('_')?;
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_lowercase()) {
        return None;
    }

    table.iter().copied().find(|token| {
        let stem = token.stem();
        stem.len() >= NEAR_MISS_MIN_LEN && is_one_typo_away(segment, stem)
    })
}

fn is_one_typo_away(candidate: &str, token: &str) -> bool {
    let (a, b) = (candidate.as_bytes(), token.as_bytes());
    if a == b {
        return false;
    }

    match a.len() as isize - b.len() as isize {
        0 => {
            let diffs: Vec<usize> = (0..a.len()).filter(|&i| a[i] != b[i]).collect();
            matches!(diffs.as_slice(), [i, j] if *j == i + 1 && a[*i] == b[*j] && a[*j] == b[*i])
        }
        -1 => (0..b.len()).any(|skip| b[..skip] == a[..skip] && b[skip + 1..] == a[skip..]),
        _ => false,
    }
}

/// Source name carries attributes that cannot be decoded.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid attributes in {component:?}: {reason}")]
pub struct InvalidAttributesError {
    /// The offending path component.
    pub component: String,

    /// What went wrong.
    pub reason: Reason,
}

impl InvalidAttributesError {
    fn new(component: &str, reason: Reason) -> Self {
        Self {
            component: component.to_string(),
            reason,
        }
    }
}

/// Why a source name was rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Reason {
    #[error("{first} conflicts with {second}")]
    Conflict { first: Token, second: Token },

    #[error("{0} given more than once")]
    Duplicate(Token),

    #[error("{token} cannot follow {after}")]
    Misplaced { token: Token, after: Token },

    #[error("{token} is not allowed on a {kind}")]
    NotAllowed { token: Token, kind: &'static str },

    #[error("{found:?} looks like a misspelled {expected}")]
    NearMiss { found: String, expected: Token },

    #[error("{0:?} is not a valid target name")]
    InvalidName(String),
}

/// Friendly result alias :3
pub type Result<T, E = InvalidAttributesError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const AGE: &str = ".age";

    fn file(name: &str, kind: SourceFileKind) -> FileAttr {
        FileAttr::new(name, kind)
    }

    #[rstest]
    #[case("foo", file("foo", SourceFileKind::File))]
    #[case("dot_bashrc", file(".bashrc", SourceFileKind::File))]
    #[case("private_executable_dot_local", FileAttr { private: true, executable: true, ..file(".local", SourceFileKind::File) })]
    #[case("encrypted_private_readonly_empty_executable_x.age", FileAttr {
        encrypted: true, private: true, readonly: true, empty: true, executable: true,
        ..file("x", SourceFileKind::File)
    })]
    #[case("dot_gitconfig.tmpl", FileAttr { template: true, ..file(".gitconfig", SourceFileKind::File) })]
    #[case("literal_dot_foo", file("dot_foo", SourceFileKind::File))]
    #[case("literal_run_me.sh", file("run_me.sh", SourceFileKind::File))]
    #[case("foo.tmpl.literal", file("foo.tmpl", SourceFileKind::File))]
    #[case("foo.tmpl.literal.tmpl", FileAttr { template: true, ..file("foo.tmpl", SourceFileKind::File) })]
    #[case("create_dot_profile", file(".profile", SourceFileKind::Create))]
    #[case("modify_private_dot_netrc", FileAttr { private: true, ..file(".netrc", SourceFileKind::Modify) })]
    #[case("remove_dot_old", file(".old", SourceFileKind::Remove))]
    #[case("symlink_dot_vimrc", file(".vimrc", SourceFileKind::Symlink))]
    #[case("run_setup.sh", file("setup.sh", SourceFileKind::Script))]
    #[case("run_once_before_install.sh", FileAttr {
        condition: ScriptCondition::Once, order: ScriptOrder::Before,
        ..file("install.sh", SourceFileKind::Script)
    })]
    #[case("run_onchange_after_reload.sh.tmpl", FileAttr {
        condition: ScriptCondition::OnChange, order: ScriptOrder::After, template: true,
        ..file("reload.sh", SourceFileKind::Script)
    })]
    #[case("x.age", file("x.age", SourceFileKind::File))]
    #[case("remote_hosts", file("remote_hosts", SourceFileKind::File))]
    #[case("once_upon_a_time", file("once_upon_a_time", SourceFileKind::File))]
    #[case("after_hours.txt", file("after_hours.txt", SourceFileKind::File))]
    #[case("before_login", file("before_login", SourceFileKind::File))]
    #[case("onchange_notes", file("onchange_notes", SourceFileKind::File))]
    #[case("private_once_more", FileAttr { private: true, ..file("once_more", SourceFileKind::File) })]
    #[case("removed_items", file("removed_items", SourceFileKind::File))]
    #[case("created_at.log", file("created_at.log", SourceFileKind::File))]
    #[case("symlinks_list", file("symlinks_list", SourceFileKind::File))]
    #[case("befroe_dinner", file("befroe_dinner", SourceFileKind::File))]
    fn parse_file_attr(#[case] source_name: &str, #[case] expect: FileAttr) {
        let result = FileAttr::parse(source_name, AGE).unwrap();
        assert_eq!(result, expect);
    }

    #[rstest]
    #[case("run_symlink_x", Reason::Conflict { first: Token::Run, second: Token::Symlink })]
    #[case("private_private_x", Reason::Duplicate(Token::Private))]
    #[case("executable_private_x", Reason::Misplaced { token: Token::Private, after: Token::Executable })]
    #[case("private_run_x", Reason::Misplaced { token: Token::Run, after: Token::Private })]
    #[case("run_once_onchange_x", Reason::Conflict { first: Token::Once, second: Token::OnChange })]
    #[case("run_private_x", Reason::NotAllowed { token: Token::Private, kind: "script" })]
    #[case("modify_empty_x", Reason::NotAllowed { token: Token::Empty, kind: "modify file" })]
    #[case("privte_x", Reason::NearMiss { found: "privte".into(), expected: Token::Private })]
    #[case("private_exectuable_x", Reason::NearMiss { found: "exectuable".into(), expected: Token::Executable })]
    #[case("encrypte_x", Reason::NearMiss { found: "encrypte".into(), expected: Token::Encrypted })]
    #[case("run_befroe_x", Reason::NearMiss { found: "befroe".into(), expected: Token::Before })]
    #[case("dot_", Reason::InvalidName(".".into()))]
    #[case("literal_", Reason::InvalidName("".into()))]
    fn parse_file_attr_rejects(#[case] source_name: &str, #[case] reason: Reason) {
        let result = FileAttr::parse(source_name, AGE);
        assert_eq!(
            result,
            Err(InvalidAttributesError {
                component: source_name.to_string(),
                reason
            })
        );
    }

    #[rstest]
    #[case("dot_config", DirAttr::new(".config"))]
    #[case("exact_private_dot_ssh", DirAttr { exact: true, private: true, ..DirAttr::new(".ssh") })]
    #[case("external_dot_oh-my-zsh", DirAttr { external: true, ..DirAttr::new(".oh-my-zsh") })]
    #[case("remove_dot_cache", DirAttr { remove: true, ..DirAttr::new(".cache") })]
    #[case("literal_exact_x", DirAttr::new("exact_x"))]
    #[case("run_scripts", DirAttr::new("run_scripts"))]
    fn parse_dir_attr(#[case] source_name: &str, #[case] expect: DirAttr) {
        assert_eq!(DirAttr::parse(source_name).unwrap(), expect);
    }

    #[rstest]
    #[case("remove_exact_x", Reason::NotAllowed { token: Token::Exact, kind: "remove directory" })]
    #[case("private_exact_x", Reason::Misplaced { token: Token::Exact, after: Token::Private })]
    #[case("readnoly_x", Reason::NearMiss { found: "readnoly".into(), expected: Token::ReadOnly })]
    fn parse_dir_attr_rejects(#[case] source_name: &str, #[case] reason: Reason) {
        assert_eq!(
            DirAttr::parse(source_name),
            Err(InvalidAttributesError {
                component: source_name.to_string(),
                reason
            })
        );
    }

    #[rstest]
    #[case(FileAttr::default(), 0o666)]
    #[case(FileAttr { executable: true, ..Default::default() }, 0o777)]
    #[case(FileAttr { private: true, ..Default::default() }, 0o600)]
    #[case(FileAttr { readonly: true, ..Default::default() }, 0o444)]
    #[case(FileAttr { private: true, readonly: true, executable: true, ..Default::default() }, 0o500)]
    fn file_attr_perm(#[case] attr: FileAttr, #[case] expect: u32) {
        assert_eq!(attr.perm(), expect);
    }

    #[test]
    fn dir_attr_perm() {
        assert_eq!(DirAttr::default().perm(), 0o777);
        assert_eq!(DirAttr { private: true, ..Default::default() }.perm(), 0o700);
        assert_eq!(DirAttr { readonly: true, ..Default::default() }.perm(), 0o555);
    }

    const TARGET_NAMES: &[&str] = &[
        "bashrc",
        ".bashrc",
        "private_key",
        "run_me.sh",
        "once_upon",
        "after_hours.txt",
        "removed_items",
        "crate_list",
        "dot_x",
        "literal_y",
        "a.tmpl",
        "b.literal",
        ".c.tmpl",
        ".tmpl",
        "archive.age",
    ];

    fn all_file_attrs(target_name: &str) -> Vec<FileAttr> {
        let mut attrs = Vec::new();
        for bits in 0..32u8 {
            for kind in [SourceFileKind::File, SourceFileKind::Create, SourceFileKind::Modify] {
                let attr = FileAttr {
                    encrypted: bits & 1 != 0,
                    private: bits & 2 != 0,
                    readonly: bits & 4 != 0,
                    empty: bits & 8 != 0 && kind == SourceFileKind::File,
                    executable: bits & 16 != 0,
                    ..FileAttr::new(target_name, kind)
                };
                attrs.push(attr);
            }
        }
        for condition in [ScriptCondition::Always, ScriptCondition::Once, ScriptCondition::OnChange] {
            for order in [ScriptOrder::Before, ScriptOrder::During, ScriptOrder::After] {
                attrs.push(FileAttr {
                    condition,
                    order,
                    ..FileAttr::new(target_name, SourceFileKind::Script)
                });
            }
        }
        attrs.push(FileAttr::new(target_name, SourceFileKind::Remove));
        attrs.push(FileAttr::new(target_name, SourceFileKind::Symlink));
        attrs
    }

    #[test]
    fn file_attr_round_trip() {
        for target_name in TARGET_NAMES {
            for attr in all_file_attrs(target_name) {
                for template in [false, true] {
                    let attr = FileAttr { template, ..attr.clone() };
                    let source_name = attr.source_name(AGE);
                    let result = FileAttr::parse(&source_name, AGE);
                    assert_eq!(result, Ok(attr), "round trip through {source_name:?}");
                }
            }
        }
    }

    #[test]
    fn dir_attr_round_trip() {
        let names = [".config", "config", "exact_x", "private", "external_y", "remove_me", "privte_z"];
        for target_name in names {
            for bits in 0..16u8 {
                let attr = DirAttr {
                    external: bits & 1 != 0,
                    exact: bits & 2 != 0,
                    private: bits & 4 != 0,
                    readonly: bits & 8 != 0,
                    ..DirAttr::new(target_name)
                };
                let source_name = attr.source_name();
                assert_eq!(DirAttr::parse(&source_name), Ok(attr), "round trip through {source_name:?}");
            }
            let removed = DirAttr { remove: true, ..DirAttr::new(target_name) };
            assert_eq!(DirAttr::parse(&removed.source_name()), Ok(removed));
        }
    }

    #[test]
    fn source_name_escapes_tokens() {
        assert_eq!(FileAttr::new("private_key", SourceFileKind::File).source_name(AGE), "literal_private_key");
        assert_eq!(FileAttr::new("privte_key", SourceFileKind::File).source_name(AGE), "literal_privte_key");
        assert_eq!(FileAttr::new("x.tmpl", SourceFileKind::File).source_name(AGE), "x.tmpl.literal");
        assert_eq!(
            FileAttr { encrypted: true, private: true, ..FileAttr::new(".ssh_key", SourceFileKind::File) }
                .source_name(AGE),
            "encrypted_private_dot_ssh_key.age"
        );
        assert_eq!(DirAttr { exact: true, ..DirAttr::new(".vim") }.source_name(), "exact_dot_vim");
    }
}
