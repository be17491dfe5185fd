//! Source-name attribute codec.
//!
//! A source entry's on-disk name encodes everything about its target: the
//! target name, entry type, permission narrowing, templating, encryption and
//! script ordering. [`parse_dir_attr`] / [`parse_file_attr`] decode a name and
//! [`DirAttr::source_name`] / [`FileAttr::source_name`] encode it again.
//!
//! Prefixes are consumed left to right in a fixed order, each at most once.
//! Encoding emits them in the same order, so for every legal attribute
//! combination `parse(source_name(a)) == a`.
use std::sync::LazyLock;

use regex::Regex;

pub(crate) const AFTER_PREFIX: &str = "after_";
pub(crate) const BEFORE_PREFIX: &str = "before_";
pub(crate) const CREATE_PREFIX: &str = "create_";
pub(crate) const DOT_PREFIX: &str = "dot_";
pub(crate) const EMPTY_PREFIX: &str = "empty_";
pub(crate) const ENCRYPTED_PREFIX: &str = "encrypted_";
pub(crate) const EXACT_PREFIX: &str = "exact_";
pub(crate) const EXECUTABLE_PREFIX: &str = "executable_";
pub(crate) const EXTERNAL_PREFIX: &str = "external_";
pub(crate) const LITERAL_PREFIX: &str = "literal_";
pub(crate) const MODIFY_PREFIX: &str = "modify_";
pub(crate) const ONCE_PREFIX: &str = "once_";
pub(crate) const ONCHANGE_PREFIX: &str = "onchange_";
pub(crate) const PRIVATE_PREFIX: &str = "private_";
pub(crate) const READONLY_PREFIX: &str = "readonly_";
pub(crate) const REMOVE_PREFIX: &str = "remove_";
pub(crate) const RUN_PREFIX: &str = "run_";
pub(crate) const SYMLINK_PREFIX: &str = "symlink_";

/// Suffix that escapes a target name ending in a recognised suffix.
pub const LITERAL_SUFFIX: &str = ".literal";

/// Suffix marking a source file as a template.
pub const TEMPLATE_SUFFIX: &str = ".tmpl";

/// Target names that would be mis-parsed as directory prefixes.
static DIR_PREFIX_RX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\A(dot|exact|external|literal|private|readonly|remove)_").ok()
});

/// Target names that would be mis-parsed as file prefixes.
static FILE_PREFIX_RX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"\A(after|before|create|dot|empty|encrypted|executable|literal|modify|once|onchange|private|readonly|remove|run|symlink)_",
    )
    .ok()
});

/// Target names that would be mis-parsed as carrying a recognised suffix.
static FILE_SUFFIX_RX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\.(literal|tmpl)\z").ok());

fn rx_matches(rx: &LazyLock<Option<Regex>>, s: &str) -> bool {
    rx.as_ref().is_some_and(|rx| rx.is_match(s))
}

/// Strip `prefix` from `name` if present, reporting whether it was.
fn cut_prefix<'a>(name: &'a str, prefix: &str) -> (&'a str, bool) {
    name.strip_prefix(prefix).map_or((name, false), |rest| (rest, true))
}

/// Decode the `dot_` / `literal_` marker that closes every prefix run.
fn decode_target_name(name: &str) -> String {
    if let Some(rest) = name.strip_prefix(DOT_PREFIX) {
        format!(".{rest}")
    } else if let Some(rest) = name.strip_prefix(LITERAL_PREFIX) {
        rest.to_string()
    } else {
        name.to_string()
    }
}

/// Kind of target a source directory produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SourceDirType {
    /// An ordinary directory.
    #[default]
    Dir,
    /// The target directory is removed once empty.
    Remove,
}

/// Attributes decoded from a source directory name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DirAttr {
    /// Name of the directory in the destination.
    pub target_name: String,
    /// Directory or remove marker.
    pub dir_type: SourceDirType,
    /// Extraneous destination children are removed.
    pub exact: bool,
    /// Contents are copied verbatim with no attribute decoding.
    pub external: bool,
    /// Group and other permission bits are cleared.
    pub private: bool,
    /// Write permission bits are cleared.
    pub read_only: bool,
}

impl DirAttr {
    /// Encode these attributes as a source directory name.
    #[must_use]
    pub fn source_name(&self) -> String {
        let mut name = String::new();
        match self.dir_type {
            SourceDirType::Dir => {
                if self.external {
                    name.push_str(EXTERNAL_PREFIX);
                }
                if self.exact {
                    name.push_str(EXACT_PREFIX);
                }
                if self.private {
                    name.push_str(PRIVATE_PREFIX);
                }
                if self.read_only {
                    name.push_str(READONLY_PREFIX);
                }
            }
            SourceDirType::Remove => name.push_str(REMOVE_PREFIX),
        }
        if let Some(rest) = self.target_name.strip_prefix('.') {
            name.push_str(DOT_PREFIX);
            name.push_str(rest);
        } else if rx_matches(&DIR_PREFIX_RX, &self.target_name) {
            name.push_str(LITERAL_PREFIX);
            name.push_str(&self.target_name);
        } else {
            name.push_str(&self.target_name);
        }
        name
    }

    /// Permission bits before the umask is applied.
    #[must_use]
    pub const fn perm(&self) -> u32 {
        let mut perm = 0o777;
        if self.private {
            perm &= !0o077;
        }
        if self.read_only {
            perm &= !0o222;
        }
        perm
    }
}

/// Decode a source directory name.
#[must_use]
pub fn parse_dir_attr(source_name: &str) -> DirAttr {
    let mut attr = DirAttr::default();
    let mut name = source_name;
    if let Some(rest) = name.strip_prefix(REMOVE_PREFIX) {
        attr.dir_type = SourceDirType::Remove;
        name = rest;
    } else {
        (name, attr.external) = cut_prefix(name, EXTERNAL_PREFIX);
        (name, attr.exact) = cut_prefix(name, EXACT_PREFIX);
        (name, attr.private) = cut_prefix(name, PRIVATE_PREFIX);
        (name, attr.read_only) = cut_prefix(name, READONLY_PREFIX);
    }
    attr.target_name = decode_target_name(name);
    attr
}

/// Kind of target a source file produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SourceFileType {
    /// Written only if the target does not already exist.
    Create,
    /// An ordinary file.
    #[default]
    File,
    /// A script that rewrites the target's current contents.
    Modify,
    /// The target is removed.
    Remove,
    /// A script run during apply.
    Script,
    /// The contents are a symlink target.
    Symlink,
}

impl SourceFileType {
    /// Lower-case name used in listings and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::File => "file",
            Self::Modify => "modify",
            Self::Remove => "remove",
            Self::Script => "script",
            Self::Symlink => "symlink",
        }
    }
}

/// When a script runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ScriptCondition {
    /// Not a script.
    #[default]
    None,
    /// Every apply.
    Always,
    /// Once per distinct script content.
    Once,
    /// Whenever the content differs from the last run.
    OnChange,
}

/// Position of a script relative to ordinary entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScriptOrder {
    /// Before any other entry is applied.
    Before = -1,
    /// In path order with other entries.
    #[default]
    During = 0,
    /// After every other entry has been applied.
    After = 1,
}

/// Attributes decoded from a source file name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FileAttr {
    /// Name of the target in the destination.
    pub target_name: String,
    /// Type of target produced.
    pub file_type: SourceFileType,
    /// Script run condition; [`ScriptCondition::None`] for non-scripts.
    pub condition: ScriptCondition,
    /// Keep the target even when its contents are empty.
    pub empty: bool,
    /// Source contents are encrypted.
    pub encrypted: bool,
    /// Execute bits are set.
    pub executable: bool,
    /// Script ordering.
    pub order: ScriptOrder,
    /// Group and other permission bits are cleared.
    pub private: bool,
    /// Write permission bits are cleared.
    pub read_only: bool,
    /// Contents are rendered as a template.
    pub template: bool,
}

impl FileAttr {
    /// Encode these attributes as a source file name.
    #[must_use]
    pub fn source_name(&self, encrypted_suffix: &str) -> String {
        let mut name = String::new();
        let mut push_if = |flag: bool, prefix: &str| {
            if flag {
                name.push_str(prefix);
            }
        };
        match self.file_type {
            SourceFileType::Create => {
                push_if(true, CREATE_PREFIX);
                push_if(self.encrypted, ENCRYPTED_PREFIX);
                push_if(self.private, PRIVATE_PREFIX);
                push_if(self.read_only, READONLY_PREFIX);
                push_if(self.empty, EMPTY_PREFIX);
                push_if(self.executable, EXECUTABLE_PREFIX);
            }
            SourceFileType::File => {
                push_if(self.encrypted, ENCRYPTED_PREFIX);
                push_if(self.private, PRIVATE_PREFIX);
                push_if(self.read_only, READONLY_PREFIX);
                push_if(self.empty, EMPTY_PREFIX);
                push_if(self.executable, EXECUTABLE_PREFIX);
            }
            SourceFileType::Modify => {
                push_if(true, MODIFY_PREFIX);
                push_if(self.encrypted, ENCRYPTED_PREFIX);
                push_if(self.private, PRIVATE_PREFIX);
                push_if(self.read_only, READONLY_PREFIX);
                push_if(self.executable, EXECUTABLE_PREFIX);
            }
            SourceFileType::Remove => push_if(true, REMOVE_PREFIX),
            SourceFileType::Script => {
                push_if(true, RUN_PREFIX);
                push_if(self.condition == ScriptCondition::Once, ONCE_PREFIX);
                push_if(self.condition == ScriptCondition::OnChange, ONCHANGE_PREFIX);
                push_if(self.order == ScriptOrder::Before, BEFORE_PREFIX);
                push_if(self.order == ScriptOrder::After, AFTER_PREFIX);
            }
            SourceFileType::Symlink => push_if(true, SYMLINK_PREFIX),
        }
        if let Some(rest) = self.target_name.strip_prefix('.') {
            name.push_str(DOT_PREFIX);
            name.push_str(rest);
        } else if rx_matches(&FILE_PREFIX_RX, &self.target_name) {
            name.push_str(LITERAL_PREFIX);
            name.push_str(&self.target_name);
        } else {
            name.push_str(&self.target_name);
        }
        if rx_matches(&FILE_SUFFIX_RX, &self.target_name) {
            name.push_str(LITERAL_SUFFIX);
        }
        if self.template {
            name.push_str(TEMPLATE_SUFFIX);
        }
        if self.encrypted {
            name.push_str(encrypted_suffix);
        }
        name
    }

    /// Permission bits before the umask is applied.
    #[must_use]
    pub const fn perm(&self) -> u32 {
        let mut perm = 0o666;
        if self.executable {
            perm |= 0o111;
        }
        if self.private {
            perm &= !0o077;
        }
        if self.read_only {
            perm &= !0o222;
        }
        perm
    }
}

/// Decode a source file name.
#[must_use]
pub fn parse_file_attr(source_name: &str, encrypted_suffix: &str) -> FileAttr {
    let mut attr = FileAttr::default();
    let mut name = source_name;
    if let Some(rest) = name.strip_prefix(CREATE_PREFIX) {
        attr.file_type = SourceFileType::Create;
        name = rest;
        (name, attr.encrypted) = cut_prefix(name, ENCRYPTED_PREFIX);
        (name, attr.private) = cut_prefix(name, PRIVATE_PREFIX);
        (name, attr.read_only) = cut_prefix(name, READONLY_PREFIX);
        (name, attr.empty) = cut_prefix(name, EMPTY_PREFIX);
        (name, attr.executable) = cut_prefix(name, EXECUTABLE_PREFIX);
    } else if let Some(rest) = name.strip_prefix(REMOVE_PREFIX) {
        attr.file_type = SourceFileType::Remove;
        name = rest;
    } else if let Some(rest) = name.strip_prefix(RUN_PREFIX) {
        attr.file_type = SourceFileType::Script;
        name = rest;
        attr.condition = if let Some(rest) = name.strip_prefix(ONCE_PREFIX) {
            name = rest;
            ScriptCondition::Once
        } else if let Some(rest) = name.strip_prefix(ONCHANGE_PREFIX) {
            name = rest;
            ScriptCondition::OnChange
        } else {
            ScriptCondition::Always
        };
        if let Some(rest) = name.strip_prefix(BEFORE_PREFIX) {
            name = rest;
            attr.order = ScriptOrder::Before;
        } else if let Some(rest) = name.strip_prefix(AFTER_PREFIX) {
            name = rest;
            attr.order = ScriptOrder::After;
        }
    } else if let Some(rest) = name.strip_prefix(SYMLINK_PREFIX) {
        attr.file_type = SourceFileType::Symlink;
        name = rest;
    } else if let Some(rest) = name.strip_prefix(MODIFY_PREFIX) {
        attr.file_type = SourceFileType::Modify;
        name = rest;
        (name, attr.encrypted) = cut_prefix(name, ENCRYPTED_PREFIX);
        (name, attr.private) = cut_prefix(name, PRIVATE_PREFIX);
        (name, attr.read_only) = cut_prefix(name, READONLY_PREFIX);
        (name, attr.executable) = cut_prefix(name, EXECUTABLE_PREFIX);
    } else {
        (name, attr.encrypted) = cut_prefix(name, ENCRYPTED_PREFIX);
        (name, attr.private) = cut_prefix(name, PRIVATE_PREFIX);
        (name, attr.read_only) = cut_prefix(name, READONLY_PREFIX);
        (name, attr.empty) = cut_prefix(name, EMPTY_PREFIX);
        (name, attr.executable) = cut_prefix(name, EXECUTABLE_PREFIX);
    }

    let mut target = decode_target_name(name);
    if attr.encrypted
        && !encrypted_suffix.is_empty()
        && let Some(rest) = target.strip_suffix(encrypted_suffix)
    {
        target = rest.to_string();
    }
    if let Some(rest) = target.strip_suffix(LITERAL_SUFFIX) {
        target = rest.to_string();
    } else if let Some(rest) = target.strip_suffix(TEMPLATE_SUFFIX) {
        attr.template = true;
        target = rest.strip_suffix(LITERAL_SUFFIX).unwrap_or(rest).to_string();
    }
    attr.target_name = target;
    attr
}
