//! Download packaging
//!
//! A single file is handed back as-is. Anything else is zipped into a
//! uniquely named temporary file that disappears once the payload is dropped.

use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::access::PermissionAction;
use crate::operations::{FileError, FileManager, Result};
use crate::security::VirtualPath;

/// Where the download bytes live.
#[derive(Debug)]
pub enum DownloadContent {
    File(PathBuf),
    Archive(NamedTempFile),
}

/// Download body plus the file name suggested to the client.
#[derive(Debug)]
pub struct DownloadPayload {
    pub file_name: String,
    pub content: DownloadContent,
}

impl DownloadPayload {
    pub fn is_archive(&self) -> bool {
        matches!(self.content, DownloadContent::Archive(_))
    }

    /// Open the body for reading from the start.
    pub fn open(&self) -> io::Result<File> {
        match &self.content {
            DownloadContent::File(path) => File::open(path),
            DownloadContent::Archive(temp) => temp.reopen(),
        }
    }

    /// Read the whole body, releasing any temporary archive.
    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.open()?.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

struct DownloadItem {
    name: String,
    host: PathBuf,
    is_file: bool,
}

impl FileManager {
    /// Package `names` from `path` for download.
    pub fn download(&self, path: &str, names: &[String]) -> Result<DownloadPayload> {
        let names: Vec<&str> = names.iter().map(String::as_str).filter(|n| !n.is_empty()).collect();
        if names.is_empty() {
            return Err(FileError::InvalidRequest("No items selected for download".to_string()));
        }
        let folder = VirtualPath::parse(path)?;

        let mut items = Vec::with_capacity(names.len());
        for name in &names {
            let target = folder.join(name)?;
            let host = self.resolver.resolve_virtual(&target)?;
            self.require_readable(&target.parent().unwrap_or_default())?;
            let metadata = fs::metadata(&host).map_err(|_| FileError::NotFound(name.to_string()))?;
            let is_file = !metadata.is_dir();
            self.access
                .require(&target, is_file, &[PermissionAction::Read, PermissionAction::Download])?;
            items.push(DownloadItem {
                name: target.name().unwrap_or_default().to_string(),
                host,
                is_file,
            });
        }

        if let [item] = items.as_slice() {
            if item.is_file {
                tracing::debug!("Streaming {} directly", item.host.display());
                return Ok(DownloadPayload {
                    file_name: item.name.clone(),
                    content: DownloadContent::File(item.host.clone()),
                });
            }
        }

        let file_name = match items.as_slice() {
            [item] => format!("{}.zip", item.name),
            _ if items.iter().all(|i| i.is_file) => "files.zip".to_string(),
            _ => "folders.zip".to_string(),
        };

        let temp = tempfile::Builder::new()
            .prefix(&format!("fileman-{}-", uuid::Uuid::new_v4()))
            .suffix(".zip")
            .tempfile()?;
        self.write_archive(temp.as_file(), &items)?;
        tracing::debug!("Built {} with {} item(s)", file_name, items.len());

        Ok(DownloadPayload {
            file_name,
            content: DownloadContent::Archive(temp),
        })
    }

    fn write_archive<W: Write + Seek>(&self, sink: W, items: &[DownloadItem]) -> Result<()> {
        let mut writer = ZipWriter::new(sink);
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for item in items {
            if item.is_file {
                writer.start_file(item.name.as_str(), options)?;
                io::copy(&mut File::open(&item.host)?, &mut writer)?;
            } else {
                self.add_folder(&mut writer, &item.host, &item.name, options)?;
            }
        }

        writer.finish()?;
        Ok(())
    }

    /// Add a folder tree under `base/`. Every entry goes back through the
    /// resolver; one that fails aborts the whole archive.
    fn add_folder<W: Write + Seek>(
        &self,
        writer: &mut ZipWriter<W>,
        dir: &Path,
        base: &str,
        options: SimpleFileOptions,
    ) -> Result<()> {
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            self.resolver.virtual_path_of(entry.path())?;

            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let mut internal = base.to_string();
            for part in relative.components() {
                internal.push('/');
                internal.push_str(&part.as_os_str().to_string_lossy());
            }

            if entry.file_type().is_dir() {
                if !has_direct_files(entry.path()) {
                    writer.add_directory(format!("{}/", internal), options)?;
                }
            } else {
                writer.start_file(internal, options)?;
                io::copy(&mut File::open(entry.path())?, writer)?;
            }
        }
        Ok(())
    }
}

fn has_direct_files(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.file_type().map(|t| !t.is_dir()).unwrap_or(false))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessDetails, AccessRule, Permission};
    use crate::operations::ErrorKind;
    use tempfile::tempdir;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn archive_entries(payload: DownloadPayload) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(payload.open().unwrap()).unwrap();
        let mut entries: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        entries.sort();
        entries
    }

    fn fixture() -> tempfile::TempDir {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.txt"), "a").unwrap();
        fs::write(temp.path().join("b.txt"), "b").unwrap();
        fs::create_dir_all(temp.path().join("Reports").join("2024")).unwrap();
        fs::write(temp.path().join("Reports").join("summary.txt"), "s").unwrap();
        fs::create_dir_all(temp.path().join("FolderX").join("empty")).unwrap();
        fs::write(temp.path().join("FolderX").join("inner.txt"), "i").unwrap();
        temp
    }

    #[test]
    fn test_archive_naming() {
        let temp = fixture();
        let manager = FileManager::new(temp.path()).unwrap();

        let single_folder = manager.download("/", &names(&["Reports"])).unwrap();
        assert_eq!(single_folder.file_name, "Reports.zip");

        let files = manager.download("/", &names(&["a.txt", "b.txt"])).unwrap();
        assert_eq!(files.file_name, "files.zip");

        let mixed = manager.download("/", &names(&["a.txt", "FolderX"])).unwrap();
        assert_eq!(mixed.file_name, "folders.zip");
    }

    #[test]
    fn test_single_file_is_streamed() {
        let temp = fixture();
        let manager = FileManager::new(temp.path()).unwrap();

        let payload = manager.download("/", &names(&["a.txt"])).unwrap();
        assert!(!payload.is_archive());
        assert_eq!(payload.file_name, "a.txt");
        assert_eq!(payload.into_bytes().unwrap(), b"a");
    }

    #[test]
    fn test_archive_layout() {
        let temp = fixture();
        let manager = FileManager::new(temp.path()).unwrap();

        let mixed = manager.download("/", &names(&["a.txt", "FolderX"])).unwrap();
        assert_eq!(
            archive_entries(mixed),
            vec!["FolderX/empty/", "FolderX/inner.txt", "a.txt"]
        );

        let folder = manager.download("/", &names(&["Reports"])).unwrap();
        assert_eq!(
            archive_entries(folder),
            vec!["Reports/2024/", "Reports/summary.txt"]
        );
    }

    #[test]
    fn test_temp_archive_removed_on_drop() {
        let temp = fixture();
        let manager = FileManager::new(temp.path()).unwrap();

        let payload = manager.download("/", &names(&["a.txt", "b.txt"])).unwrap();
        let location = match &payload.content {
            DownloadContent::Archive(file) => file.path().to_path_buf(),
            DownloadContent::File(_) => panic!("expected an archive"),
        };
        assert!(location.exists());
        drop(payload);
        assert!(!location.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_poisoned_entry_fails_whole_archive() {
        let temp = fixture();
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("FolderX").join("escape")).unwrap();
        let manager = FileManager::new(temp.path()).unwrap();

        let err = manager.download("/", &names(&["a.txt", "FolderX"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Traversal);
    }

    #[test]
    fn test_unreadable_folder_blocks_direct_download() {
        let temp = fixture();
        fs::create_dir(temp.path().join("secret")).unwrap();
        fs::write(temp.path().join("secret").join("key.txt"), "k").unwrap();
        let manager = FileManager::new(temp.path()).unwrap().with_access(Some(AccessDetails {
            role: None,
            rules: vec![AccessRule {
                path: "/secret".to_string(),
                read: Permission::Deny,
                ..Default::default()
            }],
        }));

        let err = manager.download("/secret/", &names(&["key.txt"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        let err = manager.download("/secret/", &names(&["key.txt", "key.txt"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        assert!(manager.download("/", &names(&["a.txt"])).is_ok());
    }

    #[test]
    fn test_missing_item() {
        let temp = fixture();
        let manager = FileManager::new(temp.path()).unwrap();
        let err = manager.download("/", &names(&["nope.txt"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
