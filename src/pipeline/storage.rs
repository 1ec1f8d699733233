use crate::types::{PipelineStageResult, RasterError, RasterResult};
use chrono::Utc;
use quick_xml::de::from_str;
use quick_xml::se::to_string;
use rand::Rng;
use std::io::Write;
use std::path::{Path, PathBuf};

const RESULT_FILE: &str = "result.xml";

/// Generate a run identifier: UTC timestamp plus a random suffix
pub fn generate_run_id() -> String {
    format!(
        "run-{}-{:06x}",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        rand::rng().random::<u32>() & 0x00ff_ffff
    )
}

fn validate_component(kind: &str, value: &str) -> RasterResult<()> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\']);
    if valid {
        Ok(())
    } else {
        Err(RasterError::InvalidParameter(format!("invalid {} '{}'", kind, value)))
    }
}

/// Storage namespace of one run.
///
/// Stage outputs live at `<root>/<run_id>/<stage>/<file>` next to the
/// recorded `result.xml`. Output names depend only on the run, the stage
/// and the input names, so a retried stage overwrites its previous files.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStorage {
    root: PathBuf,
    run_id: String,
}

impl RunStorage {
    pub fn new<P: AsRef<Path>>(root: P, run_id: &str) -> RasterResult<Self> {
        validate_component("run id", run_id)?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            run_id: run_id.to_string(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(&self.run_id)
    }

    pub fn stage_dir(&self, stage: &str) -> PathBuf {
        self.run_dir().join(stage)
    }

    /// Deterministic location of an output file of `stage`
    pub fn locator_for(&self, stage: &str, file_name: &str) -> PathBuf {
        self.stage_dir(stage).join(file_name)
    }

    /// Create the stage directory
    pub fn prepare_stage(&self, stage: &str) -> RasterResult<PathBuf> {
        validate_component("stage name", stage)?;
        let dir = self.stage_dir(stage);
        std::fs::create_dir_all(&dir).map_err(|e| RasterError::unwritable(&dir, e))?;
        Ok(dir)
    }

    /// Durably record the result of a completed stage
    pub fn record(&self, result: &PipelineStageResult) -> RasterResult<()> {
        let dir = self.prepare_stage(&result.stage)?;
        let path = dir.join(RESULT_FILE);
        let xml = to_string(result).map_err(|e| RasterError::Xml(format!("Failed to serialize stage result: {}", e)))?;

        let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| RasterError::unwritable(&path, e))?;
        temp.write_all(xml.as_bytes()).map_err(|e| RasterError::unwritable(&path, e))?;
        temp.as_file().sync_all().map_err(|e| RasterError::unwritable(&path, e))?;
        temp.persist(&path).map_err(|e| RasterError::unwritable(&path, e.error))?;
        Ok(())
    }

    /// Recorded result of `stage`, if it ever completed in this run
    pub fn load(&self, stage: &str) -> RasterResult<Option<PipelineStageResult>> {
        let path = self.stage_dir(stage).join(RESULT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let xml = std::fs::read_to_string(&path).map_err(|e| RasterError::unreadable(&path, e))?;
        from_str(&xml)
            .map(Some)
            .map_err(|e| RasterError::Xml(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Delete the data files of `stage`, keeping its recorded result
    pub fn discard_outputs(&self, stage: &str) -> RasterResult<()> {
        let dir = self.stage_dir(stage);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_name() == RESULT_FILE {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        log::debug!("Discarded intermediate outputs of stage '{}' in run {}", stage, self.run_id);
        Ok(())
    }

    /// Whether `path` lies inside this run's storage
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(self.run_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Locator;
    use tempfile::TempDir;

    fn result(stage: &str) -> PipelineStageResult {
        PipelineStageResult {
            stage: stage.to_string(),
            attempt: 2,
            inputs: vec![Locator::new("/in/a.tif")],
            outputs: vec![Locator::new("/out/a.tif"), Locator::new("/out/b.tif")],
            warnings: vec!["source skipped".to_string()],
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_layout() {
        let storage = RunStorage::new("/data/runs", "run-1").unwrap();
        assert_eq!(storage.locator_for("rescale", "a.tif"), PathBuf::from("/data/runs/run-1/rescale/a.tif"));
        assert!(storage.contains(Path::new("/data/runs/run-1/mosaic/x.tif")));
        assert!(!storage.contains(Path::new("/data/runs/run-2/mosaic/x.tif")));
    }

    #[test]
    fn test_invalid_run_ids() {
        assert!(RunStorage::new("/tmp", "").is_err());
        assert!(RunStorage::new("/tmp", "../escape").is_err());
        assert!(RunStorage::new("/tmp", "..").is_err());
    }

    #[test]
    fn test_record_and_load() {
        let temp = TempDir::new().unwrap();
        let storage = RunStorage::new(temp.path(), "run-1").unwrap();
        assert!(storage.load("mosaic").unwrap().is_none());

        let recorded = result("mosaic");
        storage.record(&recorded).unwrap();
        let loaded = storage.load("mosaic").unwrap().unwrap();
        assert_eq!(loaded.stage, "mosaic");
        assert_eq!(loaded.attempt, 2);
        assert_eq!(loaded.outputs, recorded.outputs);
        assert_eq!(loaded.warnings, recorded.warnings);
    }

    #[test]
    fn test_discard_keeps_result() {
        let temp = TempDir::new().unwrap();
        let storage = RunStorage::new(temp.path(), "run-1").unwrap();
        storage.record(&result("rescale")).unwrap();
        let dir = storage.stage_dir("rescale");
        std::fs::write(dir.join("a.tif"), b"x").unwrap();
        std::fs::create_dir_all(dir.join("nested")).unwrap();

        storage.discard_outputs("rescale").unwrap();
        assert!(!dir.join("a.tif").exists());
        assert!(!dir.join("nested").exists());
        assert!(storage.load("rescale").unwrap().is_some());
        storage.discard_outputs("never-ran").unwrap();
    }

    #[test]
    fn test_generated_run_ids_are_distinct() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert!(a.starts_with("run-"));
        assert_ne!(a, b);
        assert!(RunStorage::new("/tmp", &a).is_ok());
    }
}
