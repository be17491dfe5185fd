//! Scanning the source directory into a [`SourceState`].
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use rayon::prelude::*;
use serde_json::Value;

use super::data::Format;
use super::entry::{SourceStateEntry, TargetFn, canonical};
use super::external::{External, Fetch, read_external};
use super::pattern_set::PatternSet;
use super::{
    DATA_NAME, EXTERNAL_NAME, EXTERNALS_DIR, IGNORE_NAME, PREFIX, REMOVE_NAME, ReadOptions,
    SCRIPTS_DIR, SourceState, TEMPLATES_DIR, Templater, VERSION_NAME, is_ignored,
};
use crate::actual_state::normalize_linkname;
use crate::attr::{
    DirAttr, FileAttr, ScriptCondition, SourceDirType, SourceFileType, TEMPLATE_SUFFIX,
    parse_dir_attr, parse_file_attr,
};
use crate::encryption::Encryption;
use crate::entry_type_set::SourceAttr;
use crate::error::{InconsistentTarget, InconsistentTargets, SourceError};
use crate::exec;
use crate::lazy::{LazyContents, LazyLinkname};
use crate::relpath::RelPath;
use crate::system::{self, FileInfo, FileKind, Interpreter};
use crate::target_state::TargetStateEntry;

/// Source contents of one entry, templated on demand.
#[derive(Clone)]
struct Render {
    contents: Arc<LazyContents>,
    templater: Option<Arc<Templater>>,
    name: String,
    target: RelPath,
}

impl Render {
    fn bytes(&self) -> Result<Vec<u8>> {
        let data = self.contents.contents()?;
        match &self.templater {
            Some(templater) => templater.execute(&self.name, data, Some(&self.target)),
            None => Ok(data.to_vec()),
        }
    }

    fn lazy(&self) -> LazyContents {
        let render = self.clone();
        LazyContents::new(move || render.bytes())
    }
}

fn is_blank(data: &[u8]) -> bool {
    data.iter().all(u8::is_ascii_whitespace)
}

/// Special names are handled before ordinary entries so that data,
/// templates and patterns are in place when the entries that use them are
/// read.
fn priority(name: &str) -> u8 {
    if name == VERSION_NAME {
        0
    } else if name.starts_with(DATA_NAME) {
        1
    } else if name == TEMPLATES_DIR {
        2
    } else if name.starts_with(PREFIX) {
        3
    } else {
        4
    }
}

fn list_dir(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    names.sort_by(|a, b| priority(a).cmp(&priority(b)).then_with(|| a.cmp(b)));
    Ok(names)
}

/// Every file beneath `dir`, by path relative to it.
fn collect_files(dir: &Path, prefix: &RelPath, out: &mut Vec<(RelPath, PathBuf)>) -> Result<()> {
    for name in list_dir(dir)? {
        let path = dir.join(&name);
        let rel = prefix.join(&name);
        if fs::metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?
            .is_dir()
        {
            collect_files(&path, &rel, out)?;
        } else {
            out.push((rel, path));
        }
    }
    Ok(())
}

fn unsupported(path: &Path, info: &FileInfo) -> anyhow::Error {
    let mode = match info.kind {
        FileKind::Other(kind) => kind,
        FileKind::Symlink => "symlink",
        FileKind::Dir | FileKind::File => "unknown",
    };
    SourceError::UnsupportedFileType {
        path: path.to_path_buf(),
        mode: mode.to_string(),
    }
    .into()
}

/// Run a `modify_` script with `current` on stdin and return its stdout.
fn run_modifier(
    name: &str,
    script: &[u8],
    interpreter: Option<&Interpreter>,
    current: &[u8],
) -> Result<Vec<u8>> {
    let dir = tempfile::Builder::new()
        .prefix("dotstate-modify-")
        .tempdir()
        .context("create modify script directory")?;
    system::set_perm(dir.path(), 0o700)?;
    let base = Path::new(name)
        .file_name()
        .map_or_else(|| "modify".to_string(), |n| n.to_string_lossy().to_string());
    let path = dir.path().join(base);
    fs::write(&path, script).with_context(|| format!("write {}", path.display()))?;
    system::set_perm(&path, 0o700)?;
    let (program, args) = match interpreter.filter(|i| !i.is_none()) {
        Some(i) => {
            let mut args = i.args.clone();
            args.push(path.to_string_lossy().to_string());
            (PathBuf::from(&i.command), args)
        }
        None => (path.clone(), Vec::new()),
    };
    Ok(exec::run_with_stdin(&program, &args, None, current, name)?.stdout)
}

fn modify_target(
    render: Render,
    interpreter: Option<Interpreter>,
    perm: u32,
    empty: bool,
    source_attr: SourceAttr,
) -> TargetFn {
    Arc::new(move |system, dest| {
        let (system, dest) = (Arc::clone(system), dest.to_path_buf());
        let (render, interpreter) = (render.clone(), interpreter.clone());
        Ok(TargetStateEntry::File {
            perm,
            contents: LazyContents::new(move || {
                let current = match system.read_file(&dest) {
                    Ok(data) => data,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
                    Err(e) => return Err(e).with_context(|| format!("read {}", dest.display())),
                };
                let modifier = render.bytes()?;
                if is_blank(&modifier) {
                    return Ok(current);
                }
                run_modifier(&render.name, &modifier, interpreter.as_ref(), &current)
            }),
            empty,
            overwrite: true,
            source_attr,
        })
    })
}

fn create_target(render: Render, perm: u32, source_attr: SourceAttr) -> TargetFn {
    Arc::new(move |system, dest| {
        let contents = match system.lstat(dest) {
            Ok(info) if info.kind == FileKind::File => LazyContents::ready(
                system
                    .read_file(dest)
                    .with_context(|| format!("read {}", dest.display()))?,
            ),
            Ok(_) => render.lazy(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => render.lazy(),
            Err(e) => return Err(e).with_context(|| format!("lstat {}", dest.display())),
        };
        Ok(TargetStateEntry::File {
            perm,
            contents,
            empty: true,
            overwrite: false,
            source_attr,
        })
    })
}

/// Builds a [`SourceState`] in one pass over the source directory.
pub(super) struct Reader<'a> {
    opts: &'a ReadOptions,
    templater: Arc<Templater>,
    entries: BTreeMap<RelPath, Vec<SourceStateEntry>>,
    externals: BTreeMap<RelPath, (External, String)>,
    ignore: PatternSet,
    remove: PatternSet,
    remove_dirs: BTreeSet<RelPath>,
}

impl<'a> Reader<'a> {
    pub(super) fn new(opts: &'a ReadOptions) -> Self {
        Self {
            opts,
            templater: Arc::new(Templater::new(opts)),
            entries: BTreeMap::new(),
            externals: BTreeMap::new(),
            ignore: PatternSet::new(),
            remove: PatternSet::new(),
            remove_dirs: BTreeSet::new(),
        }
    }

    pub(super) fn read(mut self) -> Result<SourceState> {
        let source_dir = self.opts.source_dir.clone();
        match fs::metadata(&source_dir) {
            Ok(meta) if meta.is_dir() => {
                self.read_dir(&source_dir, &RelPath::root(), &RelPath::root(), false)?;
            }
            Ok(_) => bail!("{}: not a directory", source_dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("{}: source directory does not exist", source_dir.display());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("stat {}", source_dir.display()));
            }
        }
        self.finish()
    }

    fn push(&mut self, target: RelPath, entry: SourceStateEntry) {
        self.entries.entry(target).or_default().push(entry);
    }

    fn ignored(&self, target: &RelPath) -> bool {
        is_ignored(&self.ignore, target)
    }

    /// Contents of a special file, executed as a template if it has the
    /// template suffix.
    fn special_contents(&self, path: &Path, rel: &RelPath) -> Result<Vec<u8>> {
        let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        if rel.base().ends_with(TEMPLATE_SUFFIX) {
            self.templater.execute(rel.as_str(), &data, None)
        } else {
            Ok(data)
        }
    }

    fn read_dir(
        &mut self,
        dir: &Path,
        source_rel: &RelPath,
        target_dir: &RelPath,
        scripts: bool,
    ) -> Result<()> {
        for name in list_dir(dir)? {
            let path = dir.join(&name);
            let rel = source_rel.join(&name);
            if name.starts_with(PREFIX) {
                if scripts {
                    return Err(SourceError::NotAllowed {
                        path: rel.to_string(),
                        dir: SCRIPTS_DIR.to_string(),
                    }
                    .into());
                }
                self.read_special(&name, &path, &rel, target_dir)?;
                continue;
            }
            if name.starts_with('.') {
                tracing::debug!("skipping {rel}");
                continue;
            }
            let meta = fs::metadata(&path).with_context(|| format!("stat {}", path.display()))?;
            let info = FileInfo::from_metadata(&meta);
            match info.kind {
                FileKind::Dir => self.read_source_dir(&path, &rel, target_dir, &name, scripts)?,
                FileKind::File => self.read_source_file(&path, &rel, target_dir, &name, scripts)?,
                FileKind::Symlink | FileKind::Other(_) => return Err(unsupported(&path, &info)),
            }
        }
        Ok(())
    }

    fn read_special(
        &mut self,
        name: &str,
        path: &Path,
        rel: &RelPath,
        target_dir: &RelPath,
    ) -> Result<()> {
        let is_dir = fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?
            .is_dir();
        if name == VERSION_NAME {
            self.check_version(path, rel)
        } else if name == DATA_NAME && is_dir {
            let mut files = Vec::new();
            collect_files(path, rel, &mut files)?;
            files
                .iter()
                .try_for_each(|(rel, path)| self.read_data(path, rel))
        } else if name.starts_with(DATA_NAME) {
            self.read_data(path, rel)
        } else if name == TEMPLATES_DIR && is_dir {
            self.read_templates(path, rel)
        } else if name == EXTERNALS_DIR && is_dir {
            let mut files = Vec::new();
            collect_files(path, rel, &mut files)?;
            files
                .iter()
                .try_for_each(|(rel, path)| self.read_external_manifest(path, rel, target_dir))
        } else if name.starts_with(EXTERNAL_NAME) {
            self.read_external_manifest(path, rel, target_dir)
        } else if name.starts_with(IGNORE_NAME) {
            let text = self.special_contents(path, rel)?;
            self.ignore
                .add_lines(&String::from_utf8_lossy(&text), target_dir, rel.as_str())
        } else if name.starts_with(REMOVE_NAME) {
            let text = self.special_contents(path, rel)?;
            self.remove
                .add_lines(&String::from_utf8_lossy(&text), target_dir, rel.as_str())
        } else if name == SCRIPTS_DIR && is_dir {
            self.read_dir(path, rel, target_dir, true)
        } else {
            tracing::debug!("skipping {rel}");
            Ok(())
        }
    }

    fn check_version(&self, path: &Path, rel: &RelPath) -> Result<()> {
        let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let need = semver::Version::parse(text.trim())
            .with_context(|| format!("{rel}: invalid version"))?;
        if need > self.opts.version {
            return Err(SourceError::TooOld {
                have: self.opts.version.clone(),
                need,
            }
            .into());
        }
        Ok(())
    }

    fn read_data(&self, path: &Path, rel: &RelPath) -> Result<()> {
        let format = Format::require(rel.base())?;
        let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let value: Value = format.decode(&data, rel.as_str())?;
        self.templater.merge(value);
        Ok(())
    }

    fn read_templates(&self, dir: &Path, rel: &RelPath) -> Result<()> {
        let mut files = Vec::new();
        collect_files(dir, &RelPath::root(), &mut files)?;
        if let Some((name, _)) = files
            .iter()
            .find(|(name, _)| name.components().any(|c| c.starts_with(PREFIX)))
        {
            return Err(SourceError::NotAllowed {
                path: rel.join_rel(name).to_string(),
                dir: TEMPLATES_DIR.to_string(),
            }
            .into());
        }
        let templates = files
            .par_iter()
            .map(|(name, path)| {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("read {}", path.display()))?;
                Ok((name.to_string(), text))
            })
            .collect::<Result<Vec<_>>>()?;
        self.templater.add_templates(templates);
        Ok(())
    }

    fn read_external_manifest(
        &mut self,
        path: &Path,
        rel: &RelPath,
        target_dir: &RelPath,
    ) -> Result<()> {
        let data = self.special_contents(path, rel)?;
        let manifest: BTreeMap<String, External> =
            Format::require(rel.base())?.decode(&data, rel.as_str())?;
        for (key, external) in manifest {
            let target = target_dir.join_rel(&external_key(&key)?);
            if self.externals.contains_key(&target) {
                return Err(SourceError::DuplicateExternal {
                    path: target.to_string(),
                }
                .into());
            }
            self.externals.insert(target, (external, rel.to_string()));
        }
        Ok(())
    }

    fn read_source_dir(
        &mut self,
        path: &Path,
        rel: &RelPath,
        target_dir: &RelPath,
        name: &str,
        scripts: bool,
    ) -> Result<()> {
        let attr = parse_dir_attr(name);
        let target = target_dir.join(&attr.target_name);
        if self.ignored(&target) {
            tracing::debug!("ignoring {target}");
            return Ok(());
        }
        if scripts {
            return self.read_dir(path, rel, &target, true);
        }
        if attr.external {
            return self.read_verbatim_dir(path, rel, &target, attr);
        }
        if attr.dir_type == SourceDirType::Remove {
            self.remove_dirs.insert(target.clone());
        }
        let perm = attr.perm() & !self.opts.umask;
        self.push(
            target.clone(),
            SourceStateEntry::Dir {
                origin: rel.to_string(),
                attr,
                perm,
                implicit: false,
                external: false,
            },
        );
        self.read_dir(path, rel, &target, false)
    }

    /// An `external_` directory: names are not decoded, permissions come
    /// from the source modes and symlinks stay symlinks.
    fn read_verbatim_dir(
        &mut self,
        path: &Path,
        rel: &RelPath,
        target: &RelPath,
        attr: DirAttr,
    ) -> Result<()> {
        let attr = DirAttr { exact: true, ..attr };
        let perm = attr.perm() & !self.opts.umask;
        self.push(
            target.clone(),
            SourceStateEntry::Dir {
                origin: rel.to_string(),
                attr,
                perm,
                implicit: false,
                external: false,
            },
        );
        for name in list_dir(path)? {
            let child = path.join(&name);
            let child_rel = rel.join(&name);
            let child_target = target.join(&name);
            if self.ignored(&child_target) {
                continue;
            }
            let meta = fs::symlink_metadata(&child)
                .with_context(|| format!("lstat {}", child.display()))?;
            let info = FileInfo::from_metadata(&meta);
            match info.kind {
                FileKind::Dir => {
                    let attr = DirAttr {
                        target_name: name,
                        private: info.perm & 0o077 == 0,
                        read_only: info.perm & 0o222 == 0,
                        ..DirAttr::default()
                    };
                    self.read_verbatim_dir(&child, &child_rel, &child_target, attr)?;
                }
                FileKind::File => {
                    let entry = verbatim_file(
                        child,
                        &child_rel,
                        &child_target,
                        name,
                        info.perm,
                        self.opts.umask,
                    );
                    self.push(child_target, entry);
                }
                FileKind::Symlink => {
                    let entry = verbatim_symlink(&child, &child_rel, name)?;
                    self.push(child_target, entry);
                }
                FileKind::Other(_) => return Err(unsupported(&child, &info)),
            }
        }
        Ok(())
    }

    /// Interpreter for `name` and the extension that selected it.
    fn interpreter_for(&self, name: &str) -> Option<(Interpreter, String)> {
        let ext = Path::new(name).extension()?.to_str()?;
        self.opts
            .interpreters
            .get(ext)
            .map(|interpreter| (interpreter.clone(), ext.to_string()))
    }

    fn read_source_file(
        &mut self,
        path: &Path,
        rel: &RelPath,
        target_dir: &RelPath,
        name: &str,
        scripts: bool,
    ) -> Result<()> {
        let mut attr = parse_file_attr(name, self.opts.encryption.encrypted_suffix());
        if scripts && attr.file_type != SourceFileType::Script {
            return Err(SourceError::NotAScript {
                path: rel.to_string(),
            }
            .into());
        }
        let interpreter = self.interpreter_for(&attr.target_name);
        if attr.file_type == SourceFileType::Modify
            && let Some((_, ext)) = &interpreter
            && let Some(stem) = attr.target_name.strip_suffix(&format!(".{ext}"))
        {
            attr.target_name = stem.to_string();
        }
        let target = target_dir.join(&attr.target_name);
        if self.ignored(&target) {
            tracing::debug!("ignoring {target}");
            return Ok(());
        }

        let origin = rel.to_string();
        if attr.file_type == SourceFileType::Remove {
            self.push(target, SourceStateEntry::Remove { origin });
            return Ok(());
        }
        let encryption = attr.encrypted.then(|| Arc::clone(&self.opts.encryption));
        let contents = source_contents(path.to_path_buf(), encryption);
        let render = Render {
            contents: Arc::clone(&contents),
            templater: attr.template.then(|| Arc::clone(&self.templater)),
            name: origin.clone(),
            target: target.clone(),
        };
        let source_attr = SourceAttr {
            encrypted: attr.encrypted,
            external: false,
            template: attr.template,
            always: attr.condition == ScriptCondition::Always,
        };
        let perm = attr.perm() & !self.opts.umask;
        let target_fn = file_target(
            &attr,
            render,
            interpreter.map(|(interpreter, _)| interpreter),
            perm,
            source_attr,
        );
        self.push(
            target,
            SourceStateEntry::File {
                origin,
                attr,
                contents,
                target: target_fn,
                external: false,
            },
        );
        Ok(())
    }

    fn finish(mut self) -> Result<SourceState> {
        self.resolve_externals()?;
        let ignore = &self.ignore;
        self.entries.retain(|target, _| !is_ignored(ignore, target));
        self.add_remove_patterns()?;
        let mut entries = self.collapse()?;
        self.add_exact_removals(&mut entries)?;
        tracing::debug!("read {} source entries", entries.len());
        Ok(SourceState {
            source_dir: self.opts.source_dir.clone(),
            dest_dir: self.opts.dest_dir.clone(),
            umask: self.opts.umask,
            entries,
            remove_dirs: self.remove_dirs,
            ignore: self.ignore,
            templater: self.templater,
        })
    }

    fn resolve_externals(&mut self) -> Result<()> {
        let fetch = Fetch {
            fetcher: Arc::clone(&self.opts.fetcher),
            state: Arc::clone(&self.opts.state),
            encryption: Arc::clone(&self.opts.encryption),
            refresh: self.opts.refresh_externals,
            now: self.opts.now,
        };
        let umask = self.opts.umask;
        for (target, (external, origin)) in std::mem::take(&mut self.externals) {
            if self.ignored(&target) {
                tracing::debug!("ignoring external {target}");
                continue;
            }
            let ignore = &self.ignore;
            let found = read_external(
                &fetch,
                &target,
                &external,
                &origin,
                &self.opts.dest_dir,
                umask,
                &|path: &RelPath| is_ignored(ignore, path),
            )?;
            for (path, entry) in found {
                self.push(path, entry);
            }
            let mut parent = target.parent();
            while let Some(dir) = parent.filter(|dir| !dir.is_empty()) {
                self.push(
                    dir.clone(),
                    SourceStateEntry::Dir {
                        origin: origin.clone(),
                        attr: DirAttr {
                            target_name: dir.base().to_string(),
                            ..DirAttr::default()
                        },
                        perm: 0o777 & !umask,
                        implicit: true,
                        external: false,
                    },
                );
                parent = dir.parent();
            }
        }
        Ok(())
    }

    fn add_remove_patterns(&mut self) -> Result<()> {
        if self.remove.is_empty() {
            return Ok(());
        }
        for target in self.remove.glob(&self.opts.dest_dir)? {
            if self.ignored(&target) {
                continue;
            }
            self.push(
                target,
                SourceStateEntry::Remove {
                    origin: REMOVE_NAME.to_string(),
                },
            );
        }
        Ok(())
    }

    /// One entry per target, or every conflicting target at once.
    fn collapse(&mut self) -> Result<BTreeMap<RelPath, SourceStateEntry>> {
        let mut entries = BTreeMap::new();
        let mut conflicts = Vec::new();
        for (target, candidates) in std::mem::take(&mut self.entries) {
            let chosen = if candidates.len() == 1 {
                Some(0)
            } else {
                canonical(&candidates)
            };
            let Some(index) = chosen else {
                let mut origins: Vec<String> = candidates
                    .iter()
                    .map(|entry| entry.origin().to_string())
                    .collect();
                origins.sort();
                conflicts.push(InconsistentTarget {
                    target: target.to_string(),
                    origins,
                });
                continue;
            };
            if let Some(entry) = candidates.into_iter().nth(index) {
                entries.insert(target, entry);
            }
        }
        if conflicts.is_empty() {
            Ok(entries)
        } else {
            Err(SourceError::Inconsistent(InconsistentTargets(conflicts)).into())
        }
    }

    /// Remove entries for destination children of exact directories that
    /// nothing declares.
    fn add_exact_removals(&self, entries: &mut BTreeMap<RelPath, SourceStateEntry>) -> Result<()> {
        let exact: Vec<(RelPath, String)> = entries
            .iter()
            .filter(|(_, entry)| entry.is_exact_dir())
            .map(|(target, entry)| (target.clone(), entry.origin().to_string()))
            .collect();
        for (dir, origin) in exact {
            let abs = dir.to_abs(&self.opts.dest_dir);
            let names = match self.opts.dest_system.read_dir(&abs) {
                Ok(names) => names,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e).with_context(|| format!("read {}", abs.display())),
            };
            for name in names {
                let child = dir.join(&name);
                if entries.contains_key(&child) || self.ignored(&child) {
                    continue;
                }
                entries.insert(
                    child,
                    SourceStateEntry::Remove {
                        origin: origin.clone(),
                    },
                );
            }
        }
        Ok(())
    }
}

/// Raw contents of a source file, decrypted when `encryption` is given.
fn source_contents(path: PathBuf, encryption: Option<Arc<dyn Encryption>>) -> Arc<LazyContents> {
    Arc::new(LazyContents::new(move || {
        let data = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        match encryption {
            Some(encryption) => encryption
                .decrypt(&data)
                .with_context(|| format!("decrypt {}", path.display())),
            None => Ok(data),
        }
    }))
}

/// A regular file inside an `external_` directory.
fn verbatim_file(
    path: PathBuf,
    rel: &RelPath,
    target: &RelPath,
    name: String,
    mode: u32,
    umask: u32,
) -> SourceStateEntry {
    let attr = FileAttr {
        target_name: name,
        executable: mode & 0o111 != 0,
        private: mode & 0o077 == 0,
        read_only: mode & 0o222 == 0,
        ..FileAttr::default()
    };
    let perm = attr.perm() & !umask;
    let contents = source_contents(path, None);
    let render = Render {
        contents: Arc::clone(&contents),
        templater: None,
        name: rel.to_string(),
        target: target.clone(),
    };
    SourceStateEntry::File {
        origin: rel.to_string(),
        attr,
        contents,
        target: Arc::new(move |_, _| {
            Ok(TargetStateEntry::File {
                perm,
                contents: render.lazy(),
                empty: false,
                overwrite: false,
                source_attr: SourceAttr::default(),
            })
        }),
        external: false,
    }
}

/// A symlink inside an `external_` directory, reproduced as a symlink.
fn verbatim_symlink(path: &Path, rel: &RelPath, name: String) -> Result<SourceStateEntry> {
    let linkname = fs::read_link(path)
        .with_context(|| format!("readlink {}", path.display()))?
        .to_string_lossy()
        .to_string();
    let target: TargetFn = {
        let linkname = linkname.clone();
        Arc::new(move |_, _| {
            Ok(TargetStateEntry::Symlink {
                linkname: LazyLinkname::ready(normalize_linkname(&linkname)),
                source_attr: SourceAttr::default(),
            })
        })
    };
    Ok(SourceStateEntry::File {
        origin: rel.to_string(),
        attr: FileAttr {
            target_name: name,
            file_type: SourceFileType::Symlink,
            ..FileAttr::default()
        },
        contents: Arc::new(LazyContents::ready(linkname.into_bytes())),
        target,
        external: false,
    })
}

fn file_target(
    attr: &FileAttr,
    render: Render,
    interpreter: Option<Interpreter>,
    perm: u32,
    source_attr: SourceAttr,
) -> TargetFn {
    match attr.file_type {
        SourceFileType::Create => create_target(render, perm, source_attr),
        SourceFileType::Modify => modify_target(render, interpreter, perm, attr.empty, source_attr),
        SourceFileType::Script => {
            let condition = attr.condition;
            Arc::new(move |_, _| {
                Ok(TargetStateEntry::Script {
                    name: render.target.clone(),
                    condition,
                    contents: render.lazy(),
                    interpreter: interpreter.clone(),
                    source_attr,
                })
            })
        }
        SourceFileType::Symlink => Arc::new(move |_, _| {
            let render = render.clone();
            Ok(TargetStateEntry::Symlink {
                linkname: LazyLinkname::new(move || {
                    let data = render.bytes()?;
                    Ok(normalize_linkname(String::from_utf8_lossy(&data).trim()))
                }),
                source_attr,
            })
        }),
        SourceFileType::File | SourceFileType::Remove => {
            let empty = attr.empty;
            Arc::new(move |_, _| {
                Ok(TargetStateEntry::File {
                    perm,
                    contents: render.lazy(),
                    empty,
                    overwrite: false,
                    source_attr,
                })
            })
        }
    }
}

/// A manifest key cleaned to a path below the manifest's directory.
fn external_key(key: &str) -> Result<RelPath> {
    let reason = if key.starts_with('/') || Path::new(key).is_absolute() {
        "absolute path"
    } else {
        match RelPath::clean(key) {
            Some(clean) if !clean.as_str().is_empty() => return Ok(clean),
            Some(_) => "empty path",
            None => "path escapes its directory",
        }
    };
    Err(SourceError::InvalidExternal {
        path: key.to_string(),
        reason: reason.to_string(),
    }
    .into())
}
