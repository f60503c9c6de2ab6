//! File intake: enumerates input `.mp4` files, optionally renames them into
//! a canonical form, validates names against a fixed pattern, and (after a
//! run) organizes successful outputs into prefix-named parent folders.

use hlsenc_config::IntakeConfig;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("{path} does not match the required naming pattern")]
    ValidationRejected { path: PathBuf },

    #[error("renaming {from} to {to} would overwrite an existing file")]
    RenameConflict { from: PathBuf, to: PathBuf },

    #[error("filesystem error: {0}")]
    FilesystemError(#[from] std::io::Error),

    #[error("invalid regex pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// One input file discovered during enumeration, after any renaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub path: PathBuf,
    /// Source file size in bytes, read at accept time.
    pub size_bytes: u64,
}

fn compile(pattern: &str) -> Result<Regex, IntakeError> {
    Regex::new(pattern).map_err(|source| IntakeError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Non-recursive enumeration of `.mp4` files (case-insensitive extension) in
/// `input_dir`. Subdirectories are not descended into.
pub fn enumerate(input_dir: &Path) -> Result<Vec<PathBuf>, IntakeError> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(input_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        let is_mp4 = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("mp4"))
            .unwrap_or(false);
        if is_mp4 {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Computes the canonical name for `path` by applying `rename_pattern`'s
/// first capture group (or the whole match if there is no group) plus the
/// `.mp4` extension. Returns `None` if the pattern does not match at all.
fn canonical_name(file_name: &str, rename_pattern: &Regex) -> Option<String> {
    let caps = rename_pattern.captures(file_name)?;
    let core = caps
        .get(1)
        .or_else(|| caps.get(0))
        .map(|m| m.as_str())
        .unwrap_or(file_name);
    Some(format!("{core}.mp4"))
}

/// Renames one file in place to its canonical name, if `cfg.auto_rename_files`
/// is set and the computed name differs from the current one. Refuses to
/// overwrite an existing file.
pub fn rename_if_needed(path: &Path, cfg: &IntakeConfig) -> Result<PathBuf, IntakeError> {
    if !cfg.auto_rename_files {
        return Ok(path.to_path_buf());
    }

    let rename_re = compile(&cfg.file_rename_pattern)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    let Some(canonical) = canonical_name(file_name, &rename_re) else {
        return Ok(path.to_path_buf());
    };

    if canonical == file_name {
        return Ok(path.to_path_buf());
    }

    let target = path.with_file_name(&canonical);
    if target.exists() {
        return Err(IntakeError::RenameConflict {
            from: path.to_path_buf(),
            to: target,
        });
    }

    std::fs::rename(path, &target)?;
    Ok(target)
}

/// Validates a file name against `cfg.file_validation_pattern`. Always
/// applied, independent of `auto_rename_files`.
pub fn validate(path: &Path, cfg: &IntakeConfig) -> Result<(), IntakeError> {
    let validation_re = compile(&cfg.file_validation_pattern)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    if validation_re.is_match(file_name) {
        Ok(())
    } else {
        Err(IntakeError::ValidationRejected {
            path: path.to_path_buf(),
        })
    }
}

/// Enumerates, renames (if configured), and validates every input file.
/// Files that fail validation are reported but do not stop processing of
/// the rest.
pub fn intake(
    input_dir: &Path,
    cfg: &IntakeConfig,
) -> Result<(Vec<InputFile>, Vec<IntakeError>), IntakeError> {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for path in enumerate(input_dir)? {
        let renamed = match rename_if_needed(&path, cfg) {
            Ok(p) => p,
            Err(e) => {
                rejected.push(e);
                continue;
            }
        };

        match validate(&renamed, cfg) {
            Ok(()) => {
                let size_bytes = std::fs::metadata(&renamed).map(|m| m.len()).unwrap_or(0);
                accepted.push(InputFile {
                    path: renamed,
                    size_bytes,
                });
            }
            Err(e) => rejected.push(e),
        }
    }

    Ok((accepted, rejected))
}

/// Derives the organizing folder prefix for one completed output directory
/// name, per `cfg.folder_organization_pattern`'s first capture group.
fn organization_prefix(dir_name: &str, pattern: &Regex) -> Option<String> {
    let caps = pattern.captures(dir_name)?;
    caps.get(1).map(|m| m.as_str().to_string())
}

/// Moves each successfully-encoded output directory under `output_root`
/// into a parent folder named after its organization prefix, e.g.
/// `100-1/` and `100-2/` both move under `100/`. Idempotent: a directory
/// already inside its target parent is left alone.
pub fn organize_outputs(
    output_root: &Path,
    completed_dir_names: &[String],
    cfg: &IntakeConfig,
) -> Result<(), IntakeError> {
    if !cfg.auto_organize_folders {
        return Ok(());
    }

    let pattern = compile(&cfg.folder_organization_pattern)?;
    let mut created_parents = HashSet::new();

    for dir_name in completed_dir_names {
        let Some(prefix) = organization_prefix(dir_name, &pattern) else {
            continue;
        };

        let source = output_root.join(dir_name);
        if !source.exists() {
            continue;
        }

        let parent_dir = output_root.join(&prefix);
        if created_parents.insert(prefix.clone()) && !parent_dir.exists() {
            std::fs::create_dir_all(&parent_dir)?;
        }

        let dest = parent_dir.join(dir_name);
        if dest.exists() {
            continue;
        }
        std::fs::rename(&source, &dest)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn default_cfg() -> IntakeConfig {
        IntakeConfig::default()
    }

    #[test]
    fn test_enumerate_finds_only_mp4_non_recursive() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("100-1.mp4")).unwrap();
        File::create(dir.path().join("100-2.MP4")).unwrap();
        File::create(dir.path().join("readme.txt")).unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir").join("200-1.mp4")).unwrap();

        let found = enumerate(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_canonical_name_strips_suffix() {
        let re = Regex::new(r"(\d+-\d+)(?:[_-].*?)?\.mp4").unwrap();
        assert_eq!(
            canonical_name("100-1_extra_junk.mp4", &re),
            Some("100-1.mp4".to_string())
        );
        assert_eq!(
            canonical_name("100-1.mp4", &re),
            Some("100-1.mp4".to_string())
        );
    }

    #[test]
    fn test_rename_if_needed_applies_canonical_name() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("100-1_raw_export.mp4");
        File::create(&original).unwrap();

        let mut cfg = default_cfg();
        cfg.auto_rename_files = true;

        let renamed = rename_if_needed(&original, &cfg).unwrap();
        assert_eq!(renamed.file_name().unwrap(), "100-1.mp4");
        assert!(renamed.exists());
        assert!(!original.exists());
    }

    #[test]
    fn test_rename_disabled_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("100-1_raw_export.mp4");
        File::create(&original).unwrap();

        let mut cfg = default_cfg();
        cfg.auto_rename_files = false;

        let result = rename_if_needed(&original, &cfg).unwrap();
        assert_eq!(result, original);
    }

    #[test]
    fn test_rename_conflict_when_target_exists() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("100-1_raw.mp4");
        File::create(&original).unwrap();
        File::create(dir.path().join("100-1.mp4")).unwrap();

        let mut cfg = default_cfg();
        cfg.auto_rename_files = true;

        let result = rename_if_needed(&original, &cfg);
        assert!(matches!(result, Err(IntakeError::RenameConflict { .. })));
    }

    #[test]
    fn test_validate_accepts_canonical_name() {
        let cfg = default_cfg();
        let path = PathBuf::from("/in/100-1.mp4");
        assert!(validate(&path, &cfg).is_ok());
    }

    #[test]
    fn test_validate_rejects_non_canonical_name() {
        let cfg = default_cfg();
        let path = PathBuf::from("/in/100-1_raw.mp4");
        assert!(matches!(
            validate(&path, &cfg),
            Err(IntakeError::ValidationRejected { .. })
        ));
    }

    #[test]
    fn test_organize_outputs_groups_by_prefix() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("100-1")).unwrap();
        std::fs::create_dir(dir.path().join("100-2")).unwrap();

        let mut cfg = default_cfg();
        cfg.auto_organize_folders = true;

        organize_outputs(
            dir.path(),
            &["100-1".to_string(), "100-2".to_string()],
            &cfg,
        )
        .unwrap();

        assert!(dir.path().join("100").join("100-1").exists());
        assert!(dir.path().join("100").join("100-2").exists());
        assert!(!dir.path().join("100-1").exists());
    }

    #[test]
    fn test_organize_outputs_disabled_is_noop() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("100-1")).unwrap();

        let cfg = default_cfg();
        organize_outputs(dir.path(), &["100-1".to_string()], &cfg).unwrap();

        assert!(dir.path().join("100-1").exists());
    }

    #[test]
    fn test_intake_separates_valid_and_invalid() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("100-1.mp4")).unwrap();
        File::create(dir.path().join("not-a-match.mp4")).unwrap();

        let cfg = default_cfg();
        let (accepted, rejected) = intake(dir.path(), &cfg).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn test_intake_populates_size_bytes() {
        use std::io::Write;

        let dir = TempDir::new().unwrap();
        let mut f = File::create(dir.path().join("100-1.mp4")).unwrap();
        f.write_all(&[0u8; 4096]).unwrap();
        drop(f);

        let cfg = default_cfg();
        let (accepted, _) = intake(dir.path(), &cfg).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].size_bytes, 4096);
    }
}
