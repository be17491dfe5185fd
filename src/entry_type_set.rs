//! Sets of entry types used by `--include` / `--exclude`.
use std::fmt;
use std::str::FromStr;

use crate::error::UnknownEntryType;

/// A set of entry types, parsed from and printed as a comma-separated list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryTypeSet(u16);

/// Names in canonical (sorted) order with their bits.
const NAMED_BITS: [(&str, EntryTypeSet); 9] = [
    ("always", EntryTypeSet::ALWAYS),
    ("dirs", EntryTypeSet::DIRS),
    ("encrypted", EntryTypeSet::ENCRYPTED),
    ("externals", EntryTypeSet::EXTERNALS),
    ("files", EntryTypeSet::FILES),
    ("remove", EntryTypeSet::REMOVE),
    ("scripts", EntryTypeSet::SCRIPTS),
    ("symlinks", EntryTypeSet::SYMLINKS),
    ("templates", EntryTypeSet::TEMPLATES),
];

impl EntryTypeSet {
    /// Directories.
    pub const DIRS: Self = Self(1 << 0);
    /// Regular files.
    pub const FILES: Self = Self(1 << 1);
    /// Removals.
    pub const REMOVE: Self = Self(1 << 2);
    /// Scripts.
    pub const SCRIPTS: Self = Self(1 << 3);
    /// Symbolic links.
    pub const SYMLINKS: Self = Self(1 << 4);
    /// Entries with encrypted source contents.
    pub const ENCRYPTED: Self = Self(1 << 5);
    /// Entries that come from externals.
    pub const EXTERNALS: Self = Self(1 << 6);
    /// Entries rendered from templates.
    pub const TEMPLATES: Self = Self(1 << 7);
    /// Scripts that run on every apply.
    pub const ALWAYS: Self = Self(1 << 8);
    /// Every type.
    pub const ALL: Self = Self((1 << 9) - 1);
    /// No types.
    pub const NONE: Self = Self(0);

    /// Whether every bit of `other` is in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Union.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// `self` with the elements of `other` removed.
    #[must_use]
    pub const fn sub(self, other: Self) -> Self {
        Self(self.0 & !other.0 & Self::ALL.0)
    }

    /// Whether an entry of structural type `kind` with source attributes
    /// `attr` belongs to this set.
    ///
    /// Attribute categories (encrypted, externals, templates, always) are
    /// matched first, then the structural type.
    #[must_use]
    pub const fn contains_entry(self, kind: Self, attr: &SourceAttr) -> bool {
        if (attr.encrypted && self.contains(Self::ENCRYPTED))
            || (attr.external && self.contains(Self::EXTERNALS))
            || (attr.template && self.contains(Self::TEMPLATES))
            || (attr.always && self.contains(Self::ALWAYS))
        {
            return true;
        }
        self.contains(kind)
    }
}

impl Default for EntryTypeSet {
    fn default() -> Self {
        Self::ALL
    }
}

impl FromStr for EntryTypeSet {
    type Err = UnknownEntryType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "none" {
            return Ok(Self::NONE);
        }
        let mut bits = Self::NONE;
        for (i, element) in s.split(',').map(str::trim).enumerate() {
            if element.is_empty() {
                continue;
            }
            let (exclude, name) = element
                .strip_prefix("no")
                .map_or((false, element), |rest| (true, rest));
            let bit = if name == "all" {
                Self::ALL
            } else {
                NAMED_BITS
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, b)| *b)
                    .ok_or_else(|| UnknownEntryType(element.to_string()))?
            };
            if i == 0 && exclude {
                bits = Self::ALL;
            }
            bits = if exclude { bits.sub(bit) } else { bits.union(bit) };
        }
        Ok(bits)
    }
}

impl fmt::Display for EntryTypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ALL => f.write_str("all"),
            Self::NONE => f.write_str("none"),
            bits => {
                let names: Vec<&str> = NAMED_BITS
                    .iter()
                    .filter(|(_, b)| bits.contains(*b))
                    .map(|(n, _)| *n)
                    .collect();
                f.write_str(&names.join(","))
            }
        }
    }
}

/// Source-side attributes that classify an entry beyond its structural type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceAttr {
    /// Contents are encrypted in the source.
    pub encrypted: bool,
    /// Entry comes from an external.
    pub external: bool,
    /// Contents are a template.
    pub template: bool,
    /// Entry is a script run on every apply.
    pub always: bool,
}

/// Include/exclude pair applied to every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryTypeFilter {
    /// Types to include.
    pub include: EntryTypeSet,
    /// Types to exclude, taking precedence over `include`.
    pub exclude: EntryTypeSet,
}

impl Default for EntryTypeFilter {
    fn default() -> Self {
        Self {
            include: EntryTypeSet::ALL,
            exclude: EntryTypeSet::NONE,
        }
    }
}

impl EntryTypeFilter {
    /// Filter from an include and exclude set.
    #[must_use]
    pub const fn new(include: EntryTypeSet, exclude: EntryTypeSet) -> Self {
        Self { include, exclude }
    }

    /// Whether the bare category `bits` passes the filter.
    #[must_use]
    pub const fn includes(&self, bits: EntryTypeSet) -> bool {
        self.include.contains(bits) && !self.exclude.contains(bits)
    }

    /// Whether a source entry should be considered at all.
    ///
    /// Only the categories knowable before evaluating the target (encrypted
    /// and external) are checked here.
    #[must_use]
    pub const fn includes_source(&self, attr: &SourceAttr) -> bool {
        !(attr.encrypted && !self.includes(EntryTypeSet::ENCRYPTED))
            && !(attr.external && !self.includes(EntryTypeSet::EXTERNALS))
    }

    /// Whether an evaluated entry passes the filter.
    #[must_use]
    pub const fn includes_entry(&self, kind: EntryTypeSet, attr: &SourceAttr) -> bool {
        self.include.contains_entry(kind, attr) && !self.exclude.contains_entry(kind, attr)
    }
}
