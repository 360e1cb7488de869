use std::path::Path;

use tracing::debug;

use timelocker_domain::{BackupTargetDescriptor, FileSelection};

use crate::error::OrchestratorError;

/// Walk result over a materialised selection, used for dry-run estimates
/// and size validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionEstimate {
    pub files: u64,
    pub bytes: u64,
}

/// Merge the descriptors of one backup request into a single selection:
/// include roots, patterns, and exclude-marker filenames, deduplicated in
/// first-seen order.
pub fn build_selection(targets: &[BackupTargetDescriptor]) -> FileSelection {
    let mut selection = FileSelection::default();
    for target in targets {
        let part = FileSelection {
            includes: target.paths.clone(),
            include_patterns: target.include_patterns.clone(),
            exclude_patterns: target.exclude_patterns.clone(),
            exclude_paths: Vec::new(),
            exclude_if_present: target.exclude_files.clone(),
        };
        selection.merge(&part);
    }
    selection
}

/// Drop include roots that are missing on the filesystem right now,
/// reporting each as a warning. Called before every attempt so paths that
/// (re)appear between retries are picked up.
pub fn materialize(
    selection: &FileSelection,
) -> Result<(FileSelection, Vec<String>), OrchestratorError> {
    let mut materialised = selection.clone();
    let mut warnings = Vec::new();

    materialised.includes.retain(|path| {
        if path.exists() {
            true
        } else {
            warnings.push(format!("backup path does not exist: {}", path.display()));
            false
        }
    });

    if materialised.includes.is_empty() {
        return Err(OrchestratorError::InvalidConfiguration(
            "no backup path exists on the filesystem".into(),
        ));
    }
    Ok((materialised, warnings))
}

/// Count files and bytes under the selection without invoking the engine.
/// Symlinks are counted but never followed, mirroring the engine's default.
pub fn estimate(selection: &FileSelection) -> SelectionEstimate {
    let mut total = SelectionEstimate::default();
    for root in &selection.includes {
        walk(root, selection, &mut total);
    }
    debug!(files = total.files, bytes = total.bytes, "selection estimated");
    total
}

fn walk(path: &Path, selection: &FileSelection, total: &mut SelectionEstimate) {
    if selection.exclude_paths.iter().any(|excluded| path.starts_with(excluded)) {
        return;
    }

    let Ok(meta) = path.symlink_metadata() else {
        return;
    };

    if meta.file_type().is_symlink() || meta.is_file() {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if excluded_by_pattern(name, &selection.exclude_patterns) {
            return;
        }
        total.files += 1;
        total.bytes += meta.len();
        return;
    }

    if meta.is_dir() {
        // A marker file prunes the whole directory.
        if selection
            .exclude_if_present
            .iter()
            .any(|marker| path.join(marker).exists())
        {
            return;
        }
        let Ok(entries) = std::fs::read_dir(path) else {
            return;
        };
        for entry in entries.flatten() {
            walk(&entry.path(), selection, total);
        }
    }
}

fn excluded_by_pattern(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| simple_glob(pattern, name))
}

/// `*`-only glob against a file name; no `*` means exact match.
fn simple_glob(pattern: &str, name: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == name;
    }
    let mut remainder = name;
    let anchored_start = !pattern.starts_with('*');
    let anchored_end = !pattern.ends_with('*');
    let segments: Vec<&str> = pattern.split('*').filter(|s| !s.is_empty()).collect();

    for (i, segment) in segments.iter().enumerate() {
        match remainder.find(segment) {
            Some(idx) => {
                if i == 0 && anchored_start && idx != 0 {
                    return false;
                }
                remainder = &remainder[idx + segment.len()..];
            }
            None => return false,
        }
    }
    !anchored_end || remainder.is_empty()
}

/// Argument list for the engine's `backup` subcommand: include roots as
/// positional paths, one `--exclude` per pattern and path, one
/// `--exclude-if-present` per marker, and a single merged `--tag` flag.
pub fn backup_args(selection: &FileSelection, tags: &[String]) -> Vec<String> {
    let mut args: Vec<String> = selection
        .includes
        .iter()
        .map(|p| p.display().to_string())
        .collect();

    if !tags.is_empty() {
        let mut sorted: Vec<String> = tags.to_vec();
        sorted.sort();
        sorted.dedup();
        args.push("--tag".into());
        args.push(sorted.join(","));
    }
    for pattern in &selection.exclude_patterns {
        args.push("--exclude".into());
        args.push(pattern.clone());
    }
    for path in &selection.exclude_paths {
        args.push("--exclude".into());
        args.push(path.display().to_string());
    }
    for marker in &selection.exclude_if_present {
        args.push("--exclude-if-present".into());
        args.push(marker.clone());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn target(name: &str, paths: Vec<PathBuf>) -> BackupTargetDescriptor {
        BackupTargetDescriptor::new(name, "demo", paths)
    }

    #[test]
    fn build_selection_merges_and_deduplicates() {
        let mut a = target("docs", vec!["/data/docs".into()]);
        a.exclude_patterns = vec!["*.tmp".into()];
        a.tags = vec!["docs".into()];
        let mut b = target("logs", vec!["/data/logs".into(), "/data/docs".into()]);
        b.exclude_patterns = vec!["*.tmp".into(), "*.old".into()];
        b.exclude_files = vec![".nobackup".into()];

        let selection = build_selection(&[a, b]);
        assert_eq!(selection.includes.len(), 2);
        assert_eq!(selection.exclude_patterns, vec!["*.tmp".to_string(), "*.old".to_string()]);
        assert_eq!(selection.exclude_if_present, vec![".nobackup".to_string()]);
    }

    #[test]
    fn materialize_drops_missing_roots_with_warnings() {
        let tmp = tempfile::tempdir().unwrap();
        let selection = FileSelection {
            includes: vec![tmp.path().to_path_buf(), "/definitely/not/here".into()],
            ..Default::default()
        };
        let (materialised, warnings) = materialize(&selection).unwrap();
        assert_eq!(materialised.includes, vec![tmp.path().to_path_buf()]);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn materialize_fails_when_nothing_exists() {
        let selection = FileSelection {
            includes: vec!["/definitely/not/here".into()],
            ..Default::default()
        };
        assert!(matches!(
            materialize(&selection),
            Err(OrchestratorError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn estimate_counts_files_and_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), vec![0u8; 100]).unwrap();
        std::fs::write(tmp.path().join("b.txt"), vec![0u8; 150]).unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/c.txt"), vec![0u8; 50]).unwrap();

        let selection = FileSelection {
            includes: vec![tmp.path().to_path_buf()],
            ..Default::default()
        };
        let estimate = estimate(&selection);
        assert_eq!(estimate.files, 3);
        assert_eq!(estimate.bytes, 300);
    }

    #[test]
    fn estimate_honours_exclude_patterns_and_markers() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("keep.txt"), b"1234").unwrap();
        std::fs::write(tmp.path().join("skip.tmp"), b"123456").unwrap();
        std::fs::create_dir(tmp.path().join("cache")).unwrap();
        std::fs::write(tmp.path().join("cache/.nobackup"), b"").unwrap();
        std::fs::write(tmp.path().join("cache/blob"), vec![0u8; 500]).unwrap();

        let selection = FileSelection {
            includes: vec![tmp.path().to_path_buf()],
            exclude_patterns: vec!["*.tmp".into()],
            exclude_if_present: vec![".nobackup".into()],
            ..Default::default()
        };
        let estimate = estimate(&selection);
        assert_eq!(estimate.files, 1);
        assert_eq!(estimate.bytes, 4);
    }

    #[test]
    fn backup_args_shape() {
        let selection = FileSelection {
            includes: vec!["/data".into()],
            exclude_patterns: vec!["*.tmp".into()],
            exclude_if_present: vec![".nobackup".into()],
            ..Default::default()
        };
        let args = backup_args(&selection, &["b".into(), "a".into(), "b".into()]);
        assert_eq!(
            args,
            vec![
                "/data",
                "--tag",
                "a,b",
                "--exclude",
                "*.tmp",
                "--exclude-if-present",
                ".nobackup"
            ]
        );
    }

    #[test]
    fn simple_glob_semantics() {
        assert!(simple_glob("*.tmp", "x.tmp"));
        assert!(!simple_glob("*.tmp", "x.tmp.bak"));
        assert!(simple_glob("cache*", "cache-dir"));
        assert!(simple_glob("exact", "exact"));
        assert!(!simple_glob("exact", "inexact"));
    }
}
