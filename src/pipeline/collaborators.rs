use anyhow::{bail, Context};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

/// What to acquire: a remote path or product query
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceDescriptor {
    /// Remote path (MOSDAC) or product location (FAPAR)
    pub location: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Region of interest, e.g. a shapefile URL
    pub region: Option<String>,
}

impl SourceDescriptor {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..Self::default()
        }
    }

    pub fn with_dates(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }
}

/// Fetches source rasters into a local directory.
///
/// Implementations are synchronous and called from the blocking pool. Their
/// errors become retryable `Collaborator` errors at the stage boundary.
pub trait Acquisition: Send + Sync {
    /// Download everything `source` names into `dest_dir`, returning the
    /// local files
    fn fetch(&self, source: &SourceDescriptor, dest_dir: &Path) -> anyhow::Result<Vec<PathBuf>>;
}

/// Makes a finished raster available under a namespace
pub trait Publication: Send + Sync {
    /// Publish `raster`, returning its public locator
    fn publish(&self, raster: &Path, namespace: &str) -> anyhow::Result<String>;
}

/// File extensions treated as raster products
pub const RASTER_EXTENSIONS: &[&str] = &["tif", "tiff", "hdf"];

pub(crate) fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// All files under `dir` with one of `extensions`, sorted by path
pub fn find_files(dir: &Path, extensions: &[&str]) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_dir() && has_extension(entry.path(), extensions) {
            found.push(entry.into_path());
        }
    }
    found.sort();
    Ok(found)
}

/// Acquisition from a local directory tree, mirroring a recursive remote
/// download: the relative layout below `location` is preserved
#[derive(Debug, Clone)]
pub struct LocalDirectoryAcquisition {
    root: PathBuf,
}

impl LocalDirectoryAcquisition {
    /// `location`s are resolved against `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl Acquisition for LocalDirectoryAcquisition {
    fn fetch(&self, source: &SourceDescriptor, dest_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let origin = self.root.join(&source.location);
        if !origin.is_dir() {
            bail!("source directory {} does not exist", origin.display());
        }

        let mut fetched = Vec::new();
        for file in find_files(&origin, RASTER_EXTENSIONS)
            .with_context(|| format!("Failed to list {}", origin.display()))?
        {
            let relative = file.strip_prefix(&origin).with_context(|| format!("{} escaped {}", file.display(), origin.display()))?;
            let target = dest_dir.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::copy(&file, &target)
                .with_context(|| format!("Failed to copy {} to {}", file.display(), target.display()))?;
            log::debug!("Fetched {} -> {}", file.display(), target.display());
            fetched.push(target);
        }

        log::info!("Fetched {} files from {}", fetched.len(), origin.display());
        Ok(fetched)
    }
}

/// Publication into `<root>/<namespace>/<file>`, overwriting existing files
#[derive(Debug, Clone)]
pub struct DirectoryPublication {
    root: PathBuf,
    base_url: Option<String>,
}

impl DirectoryPublication {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            base_url: None,
        }
    }

    /// Return `<base_url>/<namespace>/<file>` instead of the local path
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

impl Publication for DirectoryPublication {
    fn publish(&self, raster: &Path, namespace: &str) -> anyhow::Result<String> {
        let file_name = raster
            .file_name()
            .with_context(|| format!("{} has no file name", raster.display()))?;
        let dir = self.root.join(namespace);
        std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let target = dir.join(file_name);
        let mut staged = NamedTempFile::new_in(&dir).with_context(|| format!("Failed to stage in {}", dir.display()))?;
        let mut source = std::fs::File::open(raster).with_context(|| format!("Failed to open {}", raster.display()))?;
        std::io::copy(&mut source, staged.as_file_mut())
            .with_context(|| format!("Failed to publish {} to {}", raster.display(), target.display()))?;
        // temp files are created owner-only
        std::fs::set_permissions(staged.path(), source.metadata()?.permissions())?;
        staged.as_file().sync_all()?;
        staged
            .persist(&target)
            .with_context(|| format!("Failed to move published file into {}", target.display()))?;
        log::info!("Published {} to {}", raster.display(), target.display());

        Ok(match &self.base_url {
            Some(base) => format!(
                "{}/{}/{}",
                base.trim_end_matches('/'),
                namespace,
                file_name.to_string_lossy()
            ),
            None => target.to_string_lossy().into_owned(),
        })
    }
}
