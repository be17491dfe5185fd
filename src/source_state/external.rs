//! Remote sources declared in `.dotstateexternal.*` manifests.
//!
//! Archive and file contents are fetched once per read and cached in the
//! `externalCache` bucket keyed by the hex SHA-256 of the URL. Git
//! repositories are never fetched here; they become directory commands run
//! at apply time.
use std::fmt;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::entry::{SourceStateEntry, TargetFn};
use super::pattern_set::{PatternMatch, PatternSet};
use crate::attr::{DirAttr, FileAttr, SourceFileType};
use crate::digest::sha256_hex;
use crate::encryption::Encryption;
use crate::entry_type_set::SourceAttr;
use crate::error::SourceError;
use crate::exec;
use crate::lazy::{LazyContents, LazyLinkname};
use crate::persistent_state::{self, EXTERNAL_CACHE_BUCKET, PersistentState};
use crate::relpath::RelPath;
use crate::system::Cmd;
use crate::target_state::TargetStateEntry;

/// Kind of external.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExternalType {
    /// An archive extracted into a directory.
    Archive,
    /// A single member of an archive.
    ArchiveFile,
    /// A single downloaded file.
    File,
    /// A git repository cloned and pulled in place.
    GitRepo,
}

/// When cached external contents may be reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RefreshExternals {
    /// Always fetch.
    Always,
    /// Reuse the cache within the external's refresh period.
    #[default]
    Auto,
    /// Reuse any cached contents.
    Never,
}

/// Expected digest and size of fetched contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Checksum {
    /// Hex SHA-256.
    pub sha256: String,
    /// Size in bytes.
    pub size: Option<u64>,
}

/// A command and its arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExternalCommand {
    /// Program to run; empty for none.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
}

/// Extra arguments for a git subcommand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GitArgs {
    /// Arguments inserted after the subcommand.
    pub args: Vec<String>,
}

/// One entry of an externals manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct External {
    /// Kind of external; required.
    #[serde(rename = "type")]
    pub external_type: Option<ExternalType>,
    /// Source URL.
    pub url: String,
    /// Fallback URLs, tried in order after `url`.
    pub urls: Vec<String>,
    /// Fetched contents are encrypted.
    pub encrypted: bool,
    /// The extracted directory is exact.
    pub exact: bool,
    /// Set execute bits on the file.
    pub executable: bool,
    /// Clear group and other bits on the file.
    pub private: bool,
    /// Clear write bits on the file.
    #[serde(rename = "readonly")]
    pub read_only: bool,
    /// Archive members to include.
    pub include: Vec<String>,
    /// Archive members to exclude; a matching directory prunes its subtree.
    pub exclude: Vec<String>,
    /// Leading path components removed from archive members.
    pub strip_components: usize,
    /// How long cached contents stay fresh; zero is forever.
    #[serde(deserialize_with = "deserialize_period")]
    pub refresh_period: Duration,
    /// Expected checksum of the fetched bytes.
    pub checksum: Checksum,
    /// Command the fetched bytes are piped through.
    pub filter: ExternalCommand,
    /// Archive format, overriding detection from the URL.
    pub format: String,
    /// Member path of an `archive-file` external.
    pub path: String,
    /// Extra `git clone` arguments.
    pub clone: GitArgs,
    /// Extra `git pull` arguments.
    pub pull: GitArgs,
}

fn deserialize_period<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let s = String::deserialize(d)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Parse durations such as `168h`, `7d` or `1h30m`. Empty and `0` are zero.
///
/// # Errors
///
/// Returns an error for unknown units or malformed numbers.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let text = s.trim();
    if text.is_empty() || text == "0" {
        return Ok(Duration::ZERO);
    }
    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            'w' => 7 * 24 * 60 * 60,
            _ => bail!("{text}: invalid duration"),
        };
        let n: u64 = digits
            .parse()
            .with_context(|| format!("{text}: invalid duration"))?;
        total = n
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .with_context(|| format!("{text}: duration overflows"))?;
        digits.clear();
    }
    if !digits.is_empty() {
        bail!("{text}: missing unit");
    }
    Ok(Duration::from_secs(total))
}

/// Downloads external contents.
#[cfg_attr(test, mockall::automock)]
pub trait Fetcher: Send + Sync {
    /// Body of `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the status is not a success.
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Largest body accepted from a server.
const MAX_BODY_SIZE: u64 = 1 << 30;

/// Fetches over HTTP(S) with `ureq`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFetcher;

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        tracing::debug!("fetching {url}");
        let mut response = ureq::get(url)
            .call()
            .with_context(|| format!("GET {url}"))?;
        response
            .body_mut()
            .with_config()
            .limit(MAX_BODY_SIZE)
            .read_to_vec()
            .with_context(|| format!("read body of {url}"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    url: String,
    timestamp: DateTime<Utc>,
    contents: String,
}

/// Everything needed to fetch external contents. Cheap to clone into lazy
/// evaluations.
#[derive(Clone)]
pub struct Fetch {
    /// Downloader.
    pub fetcher: Arc<dyn Fetcher>,
    /// Store holding the cache bucket.
    pub state: Arc<dyn PersistentState>,
    /// Decrypts `encrypted` externals.
    pub encryption: Arc<dyn Encryption>,
    /// Cache policy.
    pub refresh: RefreshExternals,
    /// Time the read started, compared against cache timestamps.
    pub now: DateTime<Utc>,
}

impl fmt::Debug for Fetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetch")
            .field("fetcher", &"<dyn Fetcher>")
            .field("state", &self.state)
            .field("encryption", &self.encryption)
            .field("refresh", &self.refresh)
            .field("now", &self.now)
            .finish()
    }
}

impl Fetch {
    /// Raw bytes of `url`, from the cache when policy allows.
    ///
    /// `file://` URLs are read directly and never cached.
    ///
    /// # Errors
    ///
    /// Returns fetch, cache or read errors.
    pub fn raw(&self, url: &str, refresh_period: Duration) -> Result<Vec<u8>> {
        if let Some(path) = url.strip_prefix("file://") {
            return std::fs::read(path).with_context(|| format!("read {path}"));
        }

        let key = sha256_hex(url.as_bytes());
        let cached: Option<CacheEntry> =
            persistent_state::get_json(self.state.as_ref(), EXTERNAL_CACHE_BUCKET, &key)?;
        if let Some(cached) = cached {
            let fresh = match self.refresh {
                RefreshExternals::Always => false,
                RefreshExternals::Never => true,
                RefreshExternals::Auto => {
                    refresh_period.is_zero()
                        || chrono::Duration::from_std(refresh_period)
                            .ok()
                            .and_then(|period| cached.timestamp.checked_add_signed(period))
                            .is_some_and(|expiry| expiry > self.now)
                }
            };
            if fresh && let Ok(contents) = BASE64.decode(cached.contents.as_bytes()) {
                tracing::debug!("using cached {url}");
                return Ok(contents);
            }
        }

        let contents = self.fetcher.fetch(url)?;
        persistent_state::set_json(
            self.state.as_ref(),
            EXTERNAL_CACHE_BUCKET,
            &key,
            &CacheEntry {
                url: url.to_string(),
                timestamp: self.now,
                contents: BASE64.encode(&contents),
            },
        )?;
        Ok(contents)
    }

    /// Verified, decrypted and filtered contents of `external`, and the URL
    /// they came from.
    ///
    /// URLs are tried in order; the first success wins and otherwise the
    /// first error is returned.
    ///
    /// # Errors
    ///
    /// Returns fetch, checksum, decryption or filter errors.
    pub fn data(&self, target: &RelPath, external: &External) -> Result<(Vec<u8>, String)> {
        let mut first_err = None;
        let mut fetched = None;
        for url in std::iter::once(&external.url)
            .chain(&external.urls)
            .filter(|url| !url.is_empty())
        {
            match self.raw(url, external.refresh_period) {
                Ok(data) => {
                    fetched = Some((data, url.clone()));
                    break;
                }
                Err(e) => {
                    tracing::warn!("{target}: {url}: {e:#}");
                    first_err.get_or_insert(e.context(format!("{target}: {url}")));
                }
            }
        }
        let (mut data, url) = match (fetched, first_err) {
            (Some(fetched), _) => fetched,
            (None, Some(e)) => return Err(e),
            (None, None) => {
                return Err(SourceError::InvalidExternal {
                    path: target.to_string(),
                    reason: "no URL".to_string(),
                }
                .into());
            }
        };

        if let Some(size) = external.checksum.size
            && data.len() as u64 != size
        {
            return Err(SourceError::ChecksumMismatch {
                url,
                kind: "size",
                expected: size.to_string(),
                actual: data.len().to_string(),
            }
            .into());
        }
        if !external.checksum.sha256.is_empty() {
            let actual = sha256_hex(&data);
            if !actual.eq_ignore_ascii_case(&external.checksum.sha256) {
                return Err(SourceError::ChecksumMismatch {
                    url,
                    kind: "sha256",
                    expected: external.checksum.sha256.clone(),
                    actual,
                }
                .into());
            }
        }

        if external.encrypted {
            data = self
                .encryption
                .decrypt(&data)
                .with_context(|| format!("{target}: decrypt {url}"))?;
        }
        if !external.filter.command.is_empty() {
            data = exec::run_with_stdin(
                Path::new(&external.filter.command),
                &external.filter.args,
                None,
                &data,
                &external.filter.command,
            )
            .with_context(|| format!("{target}: filter {url}"))?
            .stdout;
        }
        Ok((data, url))
    }
}

/// Supported archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Uncompressed tar.
    Tar,
    /// Gzip-compressed tar.
    TarGz,
    /// Zip.
    Zip,
}

impl ArchiveFormat {
    /// Format named by `format`, or detected from the suffix of `url`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::UnknownFormat`] if neither identifies a format.
    pub fn detect(format: &str, url: &str) -> Result<Self> {
        let unknown = || -> anyhow::Error {
            SourceError::UnknownFormat {
                path: url.to_string(),
            }
            .into()
        };
        if !format.is_empty() {
            return match format {
                "tar" => Ok(Self::Tar),
                "tar.gz" | "tgz" => Ok(Self::TarGz),
                "zip" => Ok(Self::Zip),
                _ => Err(unknown()),
            };
        }
        let path = url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .to_ascii_lowercase();
        if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            Ok(Self::TarGz)
        } else if path.ends_with(".tar") {
            Ok(Self::Tar)
        } else if path.ends_with(".zip") {
            Ok(Self::Zip)
        } else {
            Err(unknown())
        }
    }
}

/// Contents of one archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberKind {
    /// A directory.
    Dir,
    /// A regular file.
    File(Vec<u8>),
    /// A symlink with its target.
    Symlink(String),
}

/// One member of an archive, in archive order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    /// Normalized `/`-separated path.
    pub name: String,
    /// Permission bits.
    pub perm: u32,
    /// Member contents.
    pub kind: MemberKind,
}

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// Every member of `data`.
///
/// # Errors
///
/// Returns decoding errors and an error for unsupported member types.
pub fn read_archive(data: &[u8], format: ArchiveFormat) -> Result<Vec<ArchiveMember>> {
    match format {
        ArchiveFormat::Tar => read_tar(Cursor::new(data)),
        ArchiveFormat::TarGz => read_tar(flate2::read::GzDecoder::new(Cursor::new(data))),
        ArchiveFormat::Zip => read_zip(data),
    }
}

/// Cleaned member name; empty for the archive root.
fn member_name(raw: &str) -> Result<String> {
    RelPath::clean(raw)
        .map(|name| name.to_string())
        .ok_or_else(|| {
            SourceError::InvalidFilename {
                name: raw.to_string(),
            }
            .into()
        })
}

fn read_tar<R: Read>(reader: R) -> Result<Vec<ArchiveMember>> {
    let mut archive = tar::Archive::new(reader);
    let mut members = Vec::new();
    for entry in archive.entries().context("read tar")? {
        let mut entry = entry.context("read tar entry")?;
        let name = member_name(&String::from_utf8_lossy(&entry.path_bytes()))?;
        if name.is_empty() {
            continue;
        }
        let perm = entry.header().mode().unwrap_or(0o644) & 0o777;
        let kind = match entry.header().entry_type() {
            tar::EntryType::Directory => MemberKind::Dir,
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mut buf = Vec::new();
                entry
                    .read_to_end(&mut buf)
                    .with_context(|| format!("{name}: read"))?;
                MemberKind::File(buf)
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .with_context(|| format!("{name}: link name"))?
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();
                MemberKind::Symlink(target)
            }
            tar::EntryType::XGlobalHeader | tar::EntryType::XHeader => continue,
            other => bail!("{name}: unsupported tar entry type {other:?}"),
        };
        members.push(ArchiveMember { name, perm, kind });
    }
    Ok(members)
}

fn read_zip(data: &[u8]) -> Result<Vec<ArchiveMember>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).context("read zip")?;
    let mut members = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("read zip entry")?;
        let name = member_name(file.name())?;
        if name.is_empty() {
            continue;
        }
        let mode = file.unix_mode();
        let kind = if file.is_dir() {
            MemberKind::Dir
        } else {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)
                .with_context(|| format!("{name}: read"))?;
            if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
                MemberKind::Symlink(String::from_utf8_lossy(&buf).to_string())
            } else {
                MemberKind::File(buf)
            }
        };
        let default_perm = if matches!(kind, MemberKind::Dir) { 0o755 } else { 0o644 };
        let perm = mode.map_or(default_perm, |m| m & 0o777);
        members.push(ArchiveMember { name, perm, kind });
    }
    Ok(members)
}

/// `name` without its first `n` components, or `None` if nothing is left.
fn strip_components(name: &str, n: usize) -> Option<String> {
    if n == 0 {
        return Some(name.to_string());
    }
    let rest: Vec<&str> = name.split('/').skip(n).collect();
    if rest.is_empty() {
        None
    } else {
        Some(rest.join("/"))
    }
}

/// Target state factory for fixed file contents.
fn file_target(contents: &Arc<LazyContents>, perm: u32, empty: bool) -> TargetFn {
    let contents = Arc::clone(contents);
    Arc::new(move |_, _| {
        let contents = Arc::clone(&contents);
        Ok(TargetStateEntry::File {
            perm,
            contents: LazyContents::new(move || Ok(contents.contents()?.to_vec())),
            empty,
            overwrite: false,
            source_attr: SourceAttr {
                external: true,
                ..SourceAttr::default()
            },
        })
    })
}

fn symlink_target(linkname: String) -> TargetFn {
    Arc::new(move |_, _| {
        Ok(TargetStateEntry::Symlink {
            linkname: LazyLinkname::ready(linkname.clone()),
            source_attr: SourceAttr {
                external: true,
                ..SourceAttr::default()
            },
        })
    })
}

/// Attributes of an archive member implied by its mode bits.
fn member_file_attr(target_name: &str, perm: u32, empty: bool, external: &External) -> FileAttr {
    FileAttr {
        target_name: target_name.to_string(),
        file_type: SourceFileType::File,
        empty,
        executable: perm & 0o111 != 0 || external.executable,
        private: perm & 0o077 == 0 || external.private,
        read_only: perm & 0o222 == 0 || external.read_only,
        ..FileAttr::default()
    }
}

fn member_entry(
    origin: &str,
    target_name: &str,
    member: ArchiveMember,
    external: &External,
    umask: u32,
) -> SourceStateEntry {
    match member.kind {
        MemberKind::Dir => SourceStateEntry::Dir {
            origin: origin.to_string(),
            attr: DirAttr {
                target_name: target_name.to_string(),
                exact: external.exact,
                private: member.perm & 0o077 == 0,
                read_only: member.perm & 0o222 == 0,
                ..DirAttr::default()
            },
            perm: member.perm & !umask,
            implicit: false,
            external: true,
        },
        MemberKind::File(data) => {
            let attr = member_file_attr(target_name, member.perm, data.is_empty(), external);
            let perm = attr.perm() & !umask;
            let contents = Arc::new(LazyContents::ready(data));
            SourceStateEntry::File {
                origin: origin.to_string(),
                target: file_target(&contents, perm, attr.empty),
                attr,
                contents,
                external: true,
            }
        }
        MemberKind::Symlink(linkname) => SourceStateEntry::File {
            origin: origin.to_string(),
            attr: FileAttr {
                target_name: target_name.to_string(),
                file_type: SourceFileType::Symlink,
                ..FileAttr::default()
            },
            contents: Arc::new(LazyContents::ready(linkname.clone().into_bytes())),
            target: symlink_target(linkname),
            external: true,
        },
    }
}

/// Entries produced by one external, before implicit parent directories.
pub type ExternalEntries = Vec<(RelPath, SourceStateEntry)>;

/// Source entries for `external` at `target`.
///
/// `ignored` reports target paths excluded by ignore patterns; they and,
/// for directories, everything beneath them are skipped.
///
/// # Errors
///
/// Returns validation, fetch and extraction errors.
pub fn read_external(
    fetch: &Fetch,
    target: &RelPath,
    external: &External,
    origin: &str,
    dest_dir: &Path,
    umask: u32,
    ignored: &dyn Fn(&RelPath) -> bool,
) -> Result<ExternalEntries> {
    let invalid = |reason: &str| -> anyhow::Error {
        SourceError::InvalidExternal {
            path: target.to_string(),
            reason: reason.to_string(),
        }
        .into()
    };
    match external.external_type {
        None => Err(invalid("missing external type")),
        Some(ExternalType::Archive) => {
            read_archive_external(fetch, target, external, origin, umask, ignored)
        }
        Some(ExternalType::ArchiveFile) => {
            if external.path.is_empty() {
                return Err(invalid("missing path"));
            }
            read_archive_file_external(fetch, target, external, origin, umask)
        }
        Some(ExternalType::File) => {
            let attr = FileAttr {
                target_name: target.base().to_string(),
                empty: true,
                executable: external.executable,
                private: external.private,
                read_only: external.read_only,
                ..FileAttr::default()
            };
            let perm = attr.perm() & !umask;
            let (lazy_fetch, lazy_target, lazy_external) =
                (fetch.clone(), target.clone(), external.clone());
            let contents = Arc::new(LazyContents::new(move || {
                Ok(lazy_fetch.data(&lazy_target, &lazy_external)?.0)
            }));
            Ok(vec![(
                target.clone(),
                SourceStateEntry::File {
                    origin: origin.to_string(),
                    target: file_target(&contents, perm, true),
                    attr,
                    contents,
                    external: true,
                },
            )])
        }
        Some(ExternalType::GitRepo) => {
            if external.url.is_empty() {
                return Err(invalid("missing url"));
            }
            let dest: PathBuf = target.to_abs(dest_dir);
            let mut clone_args = vec!["clone".to_string()];
            clone_args.extend(external.clone.args.iter().cloned());
            clone_args.push(external.url.clone());
            clone_args.push(dest.to_string_lossy().to_string());
            let mut pull_args = vec!["pull".to_string()];
            pull_args.extend(external.pull.args.iter().cloned());
            Ok(vec![(
                target.clone(),
                SourceStateEntry::Command {
                    origin: origin.to_string(),
                    init: Cmd {
                        program: "git".to_string(),
                        args: clone_args,
                        dir: dest.clone(),
                    },
                    update: Cmd {
                        program: "git".to_string(),
                        args: pull_args,
                        dir: dest,
                    },
                    refresh_period: (!external.refresh_period.is_zero())
                        .then_some(external.refresh_period),
                    force: fetch.refresh == RefreshExternals::Always,
                    perm: 0o777 & !umask,
                },
            )])
        }
    }
}

fn archive_members(
    fetch: &Fetch,
    target: &RelPath,
    external: &External,
) -> Result<(Vec<ArchiveMember>, String)> {
    let (data, url) = fetch.data(target, external)?;
    let format = ArchiveFormat::detect(&external.format, &url)?;
    let members = read_archive(&data, format).with_context(|| format!("{target}: {url}"))?;
    Ok((members, url))
}

fn read_archive_external(
    fetch: &Fetch,
    target: &RelPath,
    external: &External,
    origin: &str,
    umask: u32,
    ignored: &dyn Fn(&RelPath) -> bool,
) -> Result<ExternalEntries> {
    let (members, _) = archive_members(fetch, target, external)?;

    let mut patterns = PatternSet::new();
    for pattern in &external.include {
        patterns.add(pattern, true)?;
    }
    for pattern in &external.exclude {
        patterns.add(pattern, false)?;
    }

    let mut entries: ExternalEntries = vec![(
        target.clone(),
        SourceStateEntry::Dir {
            origin: origin.to_string(),
            attr: DirAttr {
                target_name: target.base().to_string(),
                exact: external.exact,
                ..DirAttr::default()
            },
            perm: 0o777 & !umask,
            implicit: false,
            external: true,
        },
    )];
    let mut pruned: Vec<String> = Vec::new();
    for member in members {
        if pruned
            .iter()
            .any(|dir| member.name.starts_with(dir.as_str()))
        {
            continue;
        }
        let is_dir = member.kind == MemberKind::Dir;
        // Match before stripping so identically named members at different
        // depths can be told apart.
        if !patterns.is_empty() && patterns.matches(&member.name) == PatternMatch::Exclude {
            if is_dir && patterns.has_exclude() {
                pruned.push(format!("{}/", member.name));
            }
            continue;
        }
        let Some(name) = strip_components(&member.name, external.strip_components) else {
            continue;
        };
        let member_target = target.join(&name);
        if ignored(&member_target) {
            if is_dir {
                pruned.push(format!("{}/", member.name));
            }
            continue;
        }
        let entry = member_entry(origin, member_target.base(), member, external, umask);
        entries.push((member_target, entry));
    }
    Ok(entries)
}

fn read_archive_file_external(
    fetch: &Fetch,
    target: &RelPath,
    external: &External,
    origin: &str,
    umask: u32,
) -> Result<ExternalEntries> {
    let (members, url) = archive_members(fetch, target, external)?;
    let wanted = RelPath::new(&external.path);
    for member in members {
        let Some(name) = strip_components(&member.name, external.strip_components) else {
            continue;
        };
        if name != wanted.as_str() || member.kind == MemberKind::Dir {
            continue;
        }
        let entry = member_entry(origin, target.base(), member, external, umask);
        return Ok(vec![(target.clone(), entry)]);
    }
    Err(SourceError::NotInArchive {
        url,
        path: external.path.clone(),
    }
    .into())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::encryption::NoEncryption;
    use crate::persistent_state::InMemoryState;

    fn fetch_with(fetcher: MockFetcher, refresh: RefreshExternals) -> Fetch {
        Fetch {
            fetcher: Arc::new(fetcher),
            state: Arc::new(InMemoryState::new()),
            encryption: Arc::new(NoEncryption),
            refresh,
            now: Utc::now(),
        }
    }

    fn seed_cache(fetch: &Fetch, url: &str, age: chrono::Duration, contents: &[u8]) {
        persistent_state::set_json(
            fetch.state.as_ref(),
            EXTERNAL_CACHE_BUCKET,
            &sha256_hex(url.as_bytes()),
            &CacheEntry {
                url: url.to_string(),
                timestamp: fetch.now - age,
                contents: BASE64.encode(contents),
            },
        )
        .unwrap();
    }

    fn tar_gz(files: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, data, mode) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(*mode);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    // -----------------------------------------------------------------------
    // Durations
    // -----------------------------------------------------------------------

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("168h").unwrap(), Duration::from_secs(168 * 3600));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86400));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("").unwrap(), Duration::ZERO);
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("3y").is_err());
    }

    #[test]
    fn manifest_entry_deserializes() {
        let external: External = toml::from_str(
            "type = \"archive\"\nurl = \"https://x/a.tgz\"\nstripComponents = 1\nrefreshPeriod = \"168h\"\nreadonly = true\n",
        )
        .unwrap();
        assert_eq!(external.external_type, Some(ExternalType::Archive));
        assert_eq!(external.strip_components, 1);
        assert_eq!(external.refresh_period, Duration::from_secs(168 * 3600));
        assert!(external.read_only);
    }

    // -----------------------------------------------------------------------
    // Cache
    // -----------------------------------------------------------------------

    const URL: &str = "https://example.com/plugin.tar.gz";
    const PERIOD: Duration = Duration::from_secs(3600);

    #[test]
    fn expired_cache_entry_is_refetched() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(|_| Ok(b"fresh".to_vec()));
        let fetch = fetch_with(fetcher, RefreshExternals::Auto);
        seed_cache(&fetch, URL, chrono::Duration::seconds(3601), b"stale");
        assert_eq!(fetch.raw(URL, PERIOD).unwrap(), b"fresh");
    }

    #[test]
    fn cache_entry_within_period_is_used() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().times(0);
        let fetch = fetch_with(fetcher, RefreshExternals::Auto);
        seed_cache(&fetch, URL, chrono::Duration::seconds(3599), b"cached");
        assert_eq!(fetch.raw(URL, PERIOD).unwrap(), b"cached");
    }

    #[test]
    fn refresh_modes_override_period() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().times(0);
        let fetch = fetch_with(fetcher, RefreshExternals::Never);
        seed_cache(&fetch, URL, chrono::Duration::days(365), b"old");
        assert_eq!(fetch.raw(URL, PERIOD).unwrap(), b"old");

        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(|_| Ok(b"new".to_vec()));
        let fetch = fetch_with(fetcher, RefreshExternals::Always);
        seed_cache(&fetch, URL, chrono::Duration::seconds(1), b"old");
        assert_eq!(fetch.raw(URL, Duration::ZERO).unwrap(), b"new");
    }

    #[test]
    fn fetched_contents_are_cached() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(|_| Ok(b"body".to_vec()));
        let fetch = fetch_with(fetcher, RefreshExternals::Auto);
        assert_eq!(fetch.raw(URL, Duration::ZERO).unwrap(), b"body");
        assert_eq!(fetch.raw(URL, Duration::ZERO).unwrap(), b"body");
    }

    #[test]
    fn first_working_url_wins() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|url| url == "https://a/x")
            .returning(|_| anyhow::bail!("404"));
        fetcher
            .expect_fetch()
            .withf(|url| url == "https://b/x")
            .returning(|_| Ok(b"b".to_vec()));
        let fetch = fetch_with(fetcher, RefreshExternals::Always);
        let external = External {
            url: "https://a/x".to_string(),
            urls: vec!["https://b/x".to_string()],
            ..External::default()
        };
        let (data, url) = fetch.data(&RelPath::new("x"), &external).unwrap();
        assert_eq!(data, b"b");
        assert_eq!(url, "https://b/x");
    }

    #[test]
    fn checksum_mismatch_is_reported() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(|_| Ok(b"data".to_vec()));
        let fetch = fetch_with(fetcher, RefreshExternals::Always);
        let external = External {
            url: URL.to_string(),
            checksum: Checksum {
                sha256: "00".repeat(32),
                size: None,
            },
            ..External::default()
        };
        let err = fetch.data(&RelPath::new("x"), &external).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SourceError>(),
            Some(SourceError::ChecksumMismatch { kind: "sha256", .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Archives
    // -----------------------------------------------------------------------

    #[test]
    fn format_detection() {
        assert_eq!(
            ArchiveFormat::detect("", "https://x/a.tar.gz?raw=1").unwrap(),
            ArchiveFormat::TarGz
        );
        assert_eq!(ArchiveFormat::detect("", "https://x/a.zip").unwrap(), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::detect("tar", "https://x/blob").unwrap(), ArchiveFormat::Tar);
        assert!(ArchiveFormat::detect("", "https://x/a.rar").is_err());
    }

    #[test]
    fn archive_strip_and_exclude() {
        let data = tar_gz(&[
            ("pkg-1.0/README", b"readme", 0o644),
            ("pkg-1.0/bin/tool", b"#!/bin/sh\n", 0o755),
            ("pkg-1.0/docs/a.md", b"doc", 0o644),
        ]);
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(move |_| Ok(data.clone()));
        let fetch = fetch_with(fetcher, RefreshExternals::Always);
        let external = External {
            external_type: Some(ExternalType::Archive),
            url: URL.to_string(),
            strip_components: 1,
            exclude: vec!["*/docs/*".to_string()],
            exact: true,
            ..External::default()
        };
        let target = RelPath::new(".local/pkg");
        let entries = read_external(
            &fetch,
            &target,
            &external,
            "manifest",
            Path::new("/home/u"),
            0o022,
            &|_| false,
        )
        .unwrap();
        let paths: Vec<String> = entries.iter().map(|(p, _)| p.to_string()).collect();
        assert_eq!(
            paths,
            vec![".local/pkg", ".local/pkg/README", ".local/pkg/bin/tool"]
        );
        assert!(entries[0].1.is_exact_dir());
        let SourceStateEntry::File { attr, .. } = &entries[2].1 else {
            return assert!(matches!(entries[2].1, SourceStateEntry::File { .. }));
        };
        assert!(attr.executable);
    }

    /// A tar whose single member carries `name` verbatim in its header.
    fn raw_tar(name: &str, data: &[u8]) -> Vec<u8> {
        let mut header = tar::Header::new_gnu();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&header, data).unwrap();
        builder.into_inner().unwrap()
    }

    fn zip_of(name: &str, data: &[u8]) -> Vec<u8> {
        use std::io::Write as _;
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(data).unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn tar_members_escaping_the_archive_are_rejected() {
        for name in ["../../escaped", "a/../../b", "/etc/passwd"] {
            let err = read_archive(&raw_tar(name, b"x"), ArchiveFormat::Tar).unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<SourceError>(),
                    Some(SourceError::InvalidFilename { name: n }) if n == name
                ),
                "{name}: {err:#}"
            );
        }
    }

    #[test]
    fn zip_members_escaping_the_archive_are_rejected() {
        let err = read_archive(&zip_of("../x", b"x"), ArchiveFormat::Zip).unwrap_err();
        assert_eq!(err.to_string(), "../x: invalid filename");
    }

    #[test]
    fn member_names_are_cleaned() {
        let members = read_archive(&raw_tar("./pkg/./a/../b", b"x"), ArchiveFormat::Tar).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "pkg/b");
        let members = read_archive(&zip_of("pkg/c", b"c"), ArchiveFormat::Zip).unwrap();
        assert_eq!(members[0].name, "pkg/c");
    }

    #[test]
    fn archive_file_selects_one_member() {
        let data = tar_gz(&[("dir/a", b"A", 0o644), ("dir/b", b"B", 0o644)]);
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(move |_| Ok(data.clone()));
        let fetch = fetch_with(fetcher, RefreshExternals::Always);
        let mut external = External {
            external_type: Some(ExternalType::ArchiveFile),
            url: URL.to_string(),
            path: "b".to_string(),
            strip_components: 1,
            ..External::default()
        };
        let target = RelPath::new("bin/b");
        let entries = read_external(
            &fetch, &target, &external, "m", Path::new("/h"), 0, &|_| false,
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        let SourceStateEntry::File { contents, .. } = &entries[0].1 else {
            return assert!(matches!(entries[0].1, SourceStateEntry::File { .. }));
        };
        assert_eq!(contents.contents().unwrap(), b"B");

        external.path = "missing".to_string();
        let err = read_external(
            &fetch, &target, &external, "m", Path::new("/h"), 0, &|_| false,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SourceError>(),
            Some(SourceError::NotInArchive { .. })
        ));
    }

    #[test]
    fn git_repo_becomes_clone_and_pull_commands() {
        let fetch = fetch_with(MockFetcher::new(), RefreshExternals::Auto);
        let external = External {
            external_type: Some(ExternalType::GitRepo),
            url: "https://github.com/x/y.git".to_string(),
            clone: GitArgs {
                args: vec!["--depth".to_string(), "1".to_string()],
            },
            refresh_period: Duration::from_secs(60),
            ..External::default()
        };
        let entries = read_external(
            &fetch,
            &RelPath::new(".vim/y"),
            &external,
            "m",
            Path::new("/h"),
            0o022,
            &|_| false,
        )
        .unwrap();
        let SourceStateEntry::Command {
            init,
            update,
            refresh_period,
            force,
            ..
        } = &entries[0].1
        else {
            return assert!(matches!(entries[0].1, SourceStateEntry::Command { .. }));
        };
        assert_eq!(init.to_string(), "git clone --depth 1 https://github.com/x/y.git /h/.vim/y");
        assert_eq!(update.to_string(), "git pull");
        assert_eq!(*refresh_period, Some(Duration::from_secs(60)));
        assert!(!force);
    }

    #[test]
    fn missing_type_is_invalid() {
        let fetch = fetch_with(MockFetcher::new(), RefreshExternals::Auto);
        let err = read_external(
            &fetch,
            &RelPath::new("x"),
            &External::default(),
            "m",
            Path::new("/h"),
            0,
            &|_| false,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "x: invalid external: missing external type");
    }
}
