//! Project archive
//!
//! Builds the gzip-compressed tarball the uploader sends, hashes it, and
//! extracts a verified upload into its deploy directory on the receiver.

use crate::project::{ProjectConfig, CONFIG_FILE};
use crate::protocol::TransferError;
use crate::storage::is_dangerous_target;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Read size when hashing files
const HASH_CHUNK: usize = 65536;

/// Shell-style wildcard match of `name` against `pattern`.
///
/// `*` matches any run of characters including `/`, `?` matches one
/// character, `[abc]`, `[a-z]` and `[!abc]` match character classes. An
/// unterminated `[` matches itself.
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    let name: Vec<char> = name.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();

    let (mut n, mut p) = (0, 0);
    // Pattern position after the last `*` and the name position it is tried at
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        let next = match pat.get(p) {
            Some('*') => {
                star = Some((p + 1, n));
                p += 1;
                continue;
            }
            Some('?') => Some(p + 1),
            Some('[') => match parse_class(&pat, p) {
                Some((class, after)) => class.matches(name[n]).then_some(after),
                None => (name[n] == '[').then_some(p + 1),
            },
            Some(&c) => (c == name[n]).then_some(p + 1),
            None => None,
        };

        match (next, star) {
            (Some(after), _) => {
                p = after;
                n += 1;
            }
            (None, Some((star_p, star_n))) => {
                p = star_p;
                n = star_n + 1;
                star = Some((star_p, star_n + 1));
            }
            (None, None) => return false,
        }
    }

    pat[p..].iter().all(|&c| c == '*')
}

struct CharClass {
    negated: bool,
    ranges: Vec<(char, char)>,
}

impl CharClass {
    fn matches(&self, c: char) -> bool {
        let hit = self.ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi);
        hit != self.negated
    }
}

/// Parse `[...]` starting at `start`; returns the class and the index after `]`
fn parse_class(pat: &[char], start: usize) -> Option<(CharClass, usize)> {
    let mut i = start + 1;
    let negated = pat.get(i) == Some(&'!');
    if negated {
        i += 1;
    }

    let mut ranges = Vec::new();
    let first = i;
    while i < pat.len() {
        let c = pat[i];
        if c == ']' && i > first {
            return Some((CharClass { negated, ranges }, i + 1));
        }
        if pat.get(i + 1) == Some(&'-') && pat.get(i + 2).is_some_and(|&e| e != ']') {
            ranges.push((c, pat[i + 2]));
            i += 3;
        } else {
            ranges.push((c, c));
            i += 1;
        }
    }

    None
}

/// Whether `rel` matches any include pattern
pub fn should_include(rel: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| matches_pattern(rel, p))
}

/// Whether `rel` matches any exclude pattern
pub fn should_exclude(rel: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| matches_pattern(rel, p))
}

/// Files of `project_dir` that go into the archive, as (path, member name).
///
/// `config.json` is always included; `skip` (the archive itself) never is.
pub fn select_files(
    project_dir: &Path,
    config: &ProjectConfig,
    skip: Option<&Path>,
) -> Result<Vec<(PathBuf, String)>> {
    let mut selected = Vec::new();

    for entry in WalkDir::new(project_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", project_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let full = entry.path();
        if skip.is_some_and(|s| s == full) {
            continue;
        }

        let rel = full
            .strip_prefix(project_dir)
            .with_context(|| format!("{} is outside the project", full.display()))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let wanted = rel == CONFIG_FILE
            || (should_include(&rel, &config.include) && !should_exclude(&rel, &config.exclude));
        if wanted {
            selected.push((full.to_path_buf(), rel));
        }
    }

    Ok(selected)
}

/// Build the tar.gz for `project_dir` at `out_path`; returns the member count
pub fn build(project_dir: &Path, out_path: &Path, config: &ProjectConfig) -> Result<usize> {
    if out_path.exists() {
        fs::remove_file(out_path)
            .with_context(|| format!("Failed to remove old archive: {}", out_path.display()))?;
    }

    let files = select_files(project_dir, config, Some(out_path))?;

    let file = File::create(out_path)
        .with_context(|| format!("Failed to create archive: {}", out_path.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    for (full, rel) in &files {
        builder
            .append_path_with_name(full, rel)
            .with_context(|| format!("Failed to add {} to archive", full.display()))?;
    }

    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .with_context(|| format!("Failed to finish archive: {}", out_path.display()))?;

    Ok(files.len())
}

/// Lowercase hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK];

    loop {
        let n = file
            .read(&mut buffer)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Remove everything inside `dir` except the paths in `keep` and the
/// directories leading to them
fn clear_directory(dir: &Path, keep: &[PathBuf]) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if keep.iter().any(|k| *k == path) {
            continue;
        }

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if keep.iter().any(|k| k.starts_with(&path)) {
                clear_directory(&path, keep)?;
            } else {
                fs::remove_dir_all(&path)?;
            }
        } else {
            fs::remove_file(&path)?;
        }
    }

    Ok(())
}

/// Replace the contents of `target` with the archive's members.
///
/// Paths listed in `keep` survive the clean replace. Members that would land
/// outside `target` are skipped.
pub fn extract_to(archive: &Path, target: &Path, keep: &[PathBuf]) -> Result<(), TransferError> {
    if is_dangerous_target(target) {
        return Err(TransferError::DangerousPath(target.to_path_buf()));
    }

    if target.is_dir() {
        clear_directory(target, keep)?;
    } else if target.exists() {
        fs::remove_file(target)?;
    }
    fs::create_dir_all(target)?;

    let mut tarball = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    tarball.set_preserve_permissions(true);
    tarball.unpack(target)?;

    Ok(())
}
