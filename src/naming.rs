//! Collision-free destination names: `report.txt` becomes `report(1).txt`,
//! `Photos` becomes `Photos(1)`.

use std::path::{Path, PathBuf};

/// Result of probing the counter sequence for a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameProbe {
    /// Highest name in the sequence that is already taken, if any.
    pub last_taken: Option<PathBuf>,
    /// First free name in the sequence.
    pub available: PathBuf,
}

/// Counter-suffixed variant of `target` for `count`, with `0` meaning the
/// plain name.
pub fn numbered(target: &Path, is_folder: bool, count: u32) -> PathBuf {
    if count == 0 {
        return target.to_path_buf();
    }
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let renamed = match name.rfind('.') {
        Some(idx) if !is_folder && idx > 0 => {
            format!("{}({}){}", &name[..idx], count, &name[idx..])
        }
        _ => format!("{}({})", name, count),
    };
    target.with_file_name(renamed)
}

/// Walk `name`, `name(1)`, `name(2)`, ... until a free slot turns up.
pub fn probe(target: &Path, is_folder: bool) -> NameProbe {
    let mut last_taken = None;
    let mut count = 0;
    loop {
        let candidate = numbered(target, is_folder, count);
        if std::fs::symlink_metadata(&candidate).is_err() {
            return NameProbe { last_taken, available: candidate };
        }
        last_taken = Some(candidate);
        count += 1;
    }
}

/// First free name for `target`, which is `target` itself when nothing is there.
pub fn next_available_name(target: &Path, is_folder: bool) -> PathBuf {
    probe(target, is_folder).available
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_file_counter_goes_before_extension() {
        let temp = tempdir().unwrap();
        let target = temp.path().join("a.txt");
        assert_eq!(next_available_name(&target, false), target);

        fs::write(&target, "x").unwrap();
        assert_eq!(next_available_name(&target, false), temp.path().join("a(1).txt"));

        fs::write(temp.path().join("a(1).txt"), "x").unwrap();
        let probed = probe(&target, false);
        assert_eq!(probed.available, temp.path().join("a(2).txt"));
        assert_eq!(probed.last_taken, Some(temp.path().join("a(1).txt")));
    }

    #[test]
    fn test_folder_counter_goes_at_end() {
        let temp = tempdir().unwrap();
        let target = temp.path().join("v1.2");
        fs::create_dir(&target).unwrap();
        assert_eq!(next_available_name(&target, true), temp.path().join("v1.2(1)"));
    }

    #[test]
    fn test_names_without_extension() {
        let temp = tempdir().unwrap();
        let target = temp.path().join("Makefile");
        fs::write(&target, "all:").unwrap();
        assert_eq!(next_available_name(&target, false), temp.path().join("Makefile(1)"));

        let dotfile = temp.path().join(".env");
        fs::write(&dotfile, "").unwrap();
        assert_eq!(next_available_name(&dotfile, false), temp.path().join(".env(1)"));
    }
}
