use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};

/// Appended to an archive's file name once it is in blob storage.
pub const UPLOADED_POSTFIX: &str = ".uploaded";

/// Rotation time as embedded in archive file names, always UTC.
pub const ROTATION_TIME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Where a rotating file lives and how its archives are named:
/// `<dir>/<stem>.<ext>` rotates to `<dir>/<stem>_<time>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    pub dir: PathBuf,
    pub stem: String,
    /// Extension without the dot; may be empty.
    pub ext: String,
}

/// A rotated, closed log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub path: PathBuf,
    pub stem: String,
    pub rotated_at: DateTime<Utc>,
    pub uploaded: bool,
}

impl ArchiveFile {
    /// Path the file moves to once uploaded.
    pub fn uploaded_path(&self) -> PathBuf {
        with_uploaded_postfix(&self.path)
    }
}

pub fn with_uploaded_postfix(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(UPLOADED_POSTFIX);
    PathBuf::from(name)
}

impl ArchiveLayout {
    pub fn from_live_path(path: &Path) -> Self {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self { dir, stem, ext }
    }

    pub fn live_path(&self) -> PathBuf {
        self.dir.join(self.file_name(&self.stem))
    }

    pub fn archive_path(&self, rotated_at: DateTime<Utc>) -> PathBuf {
        let base = format!("{}_{}", self.stem, rotated_at.format(ROTATION_TIME_FORMAT));
        self.dir.join(self.file_name(&base))
    }

    /// Recognize one of this layout's archives, uploaded or not.
    pub fn parse(&self, path: &Path) -> Option<ArchiveFile> {
        let name = path.file_name()?.to_str()?;
        let (name, uploaded) = match name.strip_suffix(UPLOADED_POSTFIX) {
            Some(rest) => (rest, true),
            None => (name, false),
        };

        let rest = name.strip_prefix(&self.stem)?.strip_prefix('_')?;
        let stamp = if self.ext.is_empty() {
            rest
        } else {
            rest.strip_suffix(&self.ext)?.strip_suffix('.')?
        };

        let rotated_at = NaiveDateTime::parse_from_str(stamp, ROTATION_TIME_FORMAT)
            .ok()?
            .and_utc();

        Some(ArchiveFile {
            path: path.to_path_buf(),
            stem: self.stem.clone(),
            rotated_at,
            uploaded,
        })
    }

    /// Every archive in the directory, oldest rotation first.
    pub fn list(&self) -> std::io::Result<Vec<ArchiveFile>> {
        let mut archives = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(archive) = self.parse(&entry.path()) {
                archives.push(archive);
            }
        }
        archives.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(archives)
    }

    fn file_name(&self, base: &str) -> String {
        if self.ext.is_empty() {
            base.to_string()
        } else {
            format!("{}.{}", base, self.ext)
        }
    }
}
