use std::{
    fs,
    io::{Cursor, Write},
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Context;
use chrono::Utc;
use zip::{ZipWriter, write::SimpleFileOptions};

use super::error::ReviewError;

/// Container formats the decoder is known to handle.
pub(crate) const ALLOWED_EXTENSIONS: [&str; 4] = ["avi", "mp4", "mov", "mkv"];

pub(crate) fn allowed_file(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Keep alphanumerics plus a few safe punctuation characters so an uploaded
/// name can never escape the uploads directory.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let trimmed = name.rsplit(['/', '\\']).next().unwrap_or(name);
    trimmed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect()
}

/// Owns the on-disk media directories: raw uploads and saved footage stills.
pub(crate) struct MediaStore {
    uploads: PathBuf,
    footage: PathBuf,
    footage_seq: AtomicU64,
}

impl MediaStore {
    pub(crate) fn new(uploads: impl Into<PathBuf>, footage: impl Into<PathBuf>) -> Self {
        Self {
            uploads: uploads.into(),
            footage: footage.into(),
            footage_seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn save_upload(&self, filename: &str, data: &[u8]) -> Result<PathBuf, ReviewError> {
        let name = sanitize_filename(filename);
        if name.is_empty() || !allowed_file(&name) {
            return Err(ReviewError::InvalidFormat(filename.to_string()));
        }
        fs::create_dir_all(&self.uploads)
            .with_context(|| format!("failed to create {}", self.uploads.display()))?;
        let path = self.uploads.join(name);
        fs::write(&path, data)
            .with_context(|| format!("failed to write upload {}", path.display()))?;
        Ok(path)
    }

    pub(crate) fn save_footage(&self, jpeg: &[u8]) -> Result<PathBuf, ReviewError> {
        fs::create_dir_all(&self.footage)
            .with_context(|| format!("failed to create {}", self.footage.display()))?;
        let seq = self.footage_seq.fetch_add(1, Ordering::Relaxed);
        let path = self
            .footage
            .join(format!("{}_{:04}.jpg", Utc::now().timestamp_millis(), seq));
        fs::write(&path, jpeg)
            .with_context(|| format!("failed to write footage {}", path.display()))?;
        Ok(path)
    }

    /// Bundle every saved still into a deflate zip named after the room and
    /// its diagnosis. Returns the archive name and its bytes.
    pub(crate) fn export_zip(
        &self,
        room: &str,
        diagnosis: &str,
    ) -> Result<(String, Vec<u8>), ReviewError> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();

        let mut entries: Vec<PathBuf> = match fs::read_dir(&self.footage) {
            Ok(dir) => dir
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_file())
                .collect(),
            Err(_) => Vec::new(),
        };
        entries.sort();

        for path in entries {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let data = fs::read(&path)
                .with_context(|| format!("failed to read footage {}", path.display()))?;
            writer
                .start_file(name, options)
                .context("failed to start zip entry")?;
            writer.write_all(&data).context("failed to write zip entry")?;
        }

        let cursor = writer.finish().context("failed to finish zip archive")?;
        let name = format!(
            "{}_{}.zip",
            sanitize_filename(room),
            sanitize_filename(diagnosis)
        );
        Ok((name, cursor.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_known_containers() {
        assert!(allowed_file("scope.mp4"));
        assert!(allowed_file("SCOPE.MKV"));
        assert!(!allowed_file("scope.exe"));
        assert!(!allowed_file("noextension"));
    }

    #[test]
    fn sanitize_strips_paths() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("a b?.mp4"), "ab.mp4");
        assert_eq!(sanitize_filename("c:\\tmp\\clip.mov"), "clip.mov");
    }

    #[test]
    fn upload_rejects_bad_extension_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path().join("uploads"), dir.path().join("pictures"));
        let err = store.save_upload("payload.exe", b"x").unwrap_err();
        assert!(matches!(err, ReviewError::InvalidFormat(_)));
        assert!(!dir.path().join("uploads").exists());
    }

    #[test]
    fn upload_and_footage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path().join("uploads"), dir.path().join("pictures"));

        let path = store.save_upload("clip.mp4", b"videodata").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"videodata");

        let a = store.save_footage(&[1, 2, 3]).unwrap();
        let b = store.save_footage(&[4, 5, 6]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn export_zip_contains_footage() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path().join("uploads"), dir.path().join("pictures"));
        store.save_footage(&[1, 2, 3]).unwrap();
        store.save_footage(&[4, 5, 6]).unwrap();

        let (name, bytes) = store.export_zip("room one", "Adenomatous").unwrap();
        assert_eq!(name, "roomone_Adenomatous.zip");

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut first = Vec::new();
        std::io::Read::read_to_end(&mut archive.by_index(0).unwrap(), &mut first).unwrap();
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn export_zip_with_no_footage_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path().join("uploads"), dir.path().join("pictures"));
        let (_, bytes) = store.export_zip("r", "d").unwrap();
        let archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 0);
    }
}
