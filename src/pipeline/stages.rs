use crate::core::mosaic::{MosaicParams, VirtualComposite};
use crate::core::normalize::{ConvertParams, HdfConverter};
use crate::core::rescale::{RescaleParams, RescaleProcessor};
use crate::io::raster_io::{read_raster, write_raster};
use crate::pipeline::collaborators::{find_files, has_extension, Acquisition, Publication, SourceDescriptor};
use crate::pipeline::context::StageContext;
use crate::types::{Locator, RasterError, RasterResult};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Extensions the rescale and mosaic stages pick up from directories
pub const TIFF_EXTENSIONS: &[&str] = &["tif", "tiff"];

/// What a successful attempt produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub outputs: Vec<Locator>,
    pub warnings: Vec<String>,
}

/// One step of a run.
///
/// Outputs land in the stage's storage directory under names derived from
/// the input names. Raster writes are atomic, so an abandoned or repeated
/// attempt never leaves a partial or duplicate output.
pub trait Stage: Send + Sync {
    /// Stage name; also the name of its storage directory
    fn name(&self) -> &str;

    /// Run one attempt. Called on the blocking pool.
    fn run(&self, inputs: &[Locator], ctx: &StageContext) -> RasterResult<StageOutput>;
}

/// A file input paired with the relative name its output keeps
#[derive(Debug, Clone, PartialEq)]
struct InputFile {
    path: PathBuf,
    relative: PathBuf,
}

/// Locators expanded into files
#[derive(Debug, Default)]
struct ExpandedInputs {
    files: Vec<InputFile>,
    /// File locators whose extension is not one of the requested ones
    skipped: Vec<PathBuf>,
}

/// Expand locators into files: directories are walked recursively and files
/// are taken as given, both filtered by `extensions`
fn expand_inputs(inputs: &[Locator], extensions: &[&str]) -> RasterResult<ExpandedInputs> {
    let mut expanded = ExpandedInputs::default();
    for input in inputs {
        let path = input.path();
        if path.is_dir() {
            let found = find_files(path, extensions).map_err(|e| RasterError::unreadable(path, e))?;
            for file in found {
                let relative = file.strip_prefix(path).map(Path::to_path_buf).unwrap_or_else(|_| file_name_of(&file));
                expanded.files.push(InputFile { path: file, relative });
            }
        } else if !path.exists() {
            return Err(RasterError::unreadable(path, "input does not exist"));
        } else if has_extension(path, extensions) {
            expanded.files.push(InputFile {
                path: path.to_path_buf(),
                relative: file_name_of(path),
            });
        } else {
            expanded.skipped.push(path.to_path_buf());
        }
    }
    Ok(expanded)
}

/// Expand `inputs`, logging and recording each skipped file as a warning
fn gather_inputs(
    inputs: &[Locator],
    extensions: &[&str],
    ctx: &StageContext,
    warnings: &mut Vec<String>,
) -> RasterResult<Vec<InputFile>> {
    let expanded = expand_inputs(inputs, extensions)?;
    for path in expanded.skipped {
        ctx.log.warn(format_args!("Skipping {}: not one of {:?}", path.display(), extensions));
        warnings.push(format!("skipped {}: unsupported extension", path.display()));
    }
    Ok(expanded.files)
}

fn file_name_of(path: &Path) -> PathBuf {
    path.file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("raster.tif"))
}

/// Make relative output names unique in input order by suffixing repeats
fn unique_names(files: &[InputFile]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    files
        .iter()
        .map(|file| {
            let mut candidate = file.relative.clone();
            let mut n = 1;
            while !seen.insert(candidate.clone()) {
                let stem = file.relative.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
                let ext = file.relative.extension().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
                candidate = file.relative.with_file_name(format!("{}-{}.{}", stem, n, ext));
                n += 1;
            }
            candidate
        })
        .collect()
}

fn collaborator(error: anyhow::Error) -> RasterError {
    RasterError::Collaborator(error)
}

/// Fetches the run's source data through an `Acquisition`
pub struct AcquireStage {
    acquisition: Arc<dyn Acquisition>,
    source: SourceDescriptor,
}

impl AcquireStage {
    pub const NAME: &'static str = "acquire";

    pub fn new(acquisition: Arc<dyn Acquisition>, source: SourceDescriptor) -> Self {
        Self { acquisition, source }
    }
}

impl Stage for AcquireStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, _inputs: &[Locator], ctx: &StageContext) -> RasterResult<StageOutput> {
        let dest = ctx.stage_dir()?;
        ctx.log.info(format_args!("Acquiring '{}' into {}", self.source.location, dest.display()));

        let mut files = self.acquisition.fetch(&self.source, &dest).map_err(collaborator)?;
        files.sort();
        ctx.checkpoint()?;

        ctx.log.info(format_args!("Acquired {} files", files.len()));
        Ok(StageOutput {
            outputs: files.into_iter().map(Locator::from).collect(),
            warnings: Vec::new(),
        })
    }
}

/// Converts HDF granules into georeferenced Float32 GeoTIFFs
pub struct ConvertHdfStage {
    converter: HdfConverter,
}

impl ConvertHdfStage {
    pub const NAME: &'static str = "convert";

    pub fn new(params: ConvertParams) -> Self {
        Self {
            converter: HdfConverter::new(params),
        }
    }
}

impl Stage for ConvertHdfStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, inputs: &[Locator], ctx: &StageContext) -> RasterResult<StageOutput> {
        let mut output = StageOutput::default();
        let granules = gather_inputs(inputs, &["hdf"], ctx, &mut output.warnings)?;
        if granules.is_empty() {
            return Err(RasterError::InvalidParameter("no HDF granules among the stage inputs".to_string()));
        }

        let dest = ctx.stage_dir()?;
        for granule in &granules {
            ctx.checkpoint()?;
            let conversion = self.converter.convert(&granule.path, &dest)?;
            for warning in conversion.warnings {
                ctx.log.warn(format_args!("{}: {}", granule.path.display(), warning));
                output.warnings.push(format!("{}: {}", granule.path.display(), warning));
            }
            output.outputs.push(Locator::from(conversion.output));
        }

        ctx.log.info(format_args!("Converted {} granules", granules.len()));
        Ok(output)
    }
}

/// Rescales every GeoTIFF among the inputs
pub struct RescaleStage {
    processor: RescaleProcessor,
}

impl RescaleStage {
    pub const NAME: &'static str = "rescale";

    pub fn new(params: RescaleParams) -> RasterResult<Self> {
        Ok(Self {
            processor: RescaleProcessor::new(params)?,
        })
    }
}

impl Stage for RescaleStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, inputs: &[Locator], ctx: &StageContext) -> RasterResult<StageOutput> {
        let mut output = StageOutput::default();
        let files = gather_inputs(inputs, TIFF_EXTENSIONS, ctx, &mut output.warnings)?;
        let names = unique_names(&files);
        let dest = ctx.stage_dir()?;
        let pool = ctx.thread_pool()?;

        for (file, name) in files.iter().zip(names) {
            ctx.checkpoint()?;
            let target = dest.join(&name);
            ctx.log.debug(format_args!("Processing {} -> {}", file.path.display(), target.display()));

            let raster = read_raster(&file.path)?;
            let rescaled = pool.install(|| self.processor.rescale(&raster))?;
            write_raster(&target, &rescaled)?;
            output.outputs.push(Locator::from(target));
        }

        if output.outputs.is_empty() {
            ctx.log.warn(format_args!("No GeoTIFF inputs to rescale"));
            output.warnings.push("no GeoTIFF inputs to rescale".to_string());
        }
        ctx.log.info(format_args!(
            "Rescaled {} rasters by {}",
            output.outputs.len(),
            self.processor.params().scale_factor
        ));
        Ok(output)
    }
}

/// Composes all inputs into one raster, persisting the virtual composite
/// beside the output
pub struct MosaicStage {
    params: MosaicParams,
}

impl MosaicStage {
    pub const NAME: &'static str = "mosaic";

    pub fn new(params: MosaicParams) -> Self {
        Self { params }
    }
}

impl Stage for MosaicStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, inputs: &[Locator], ctx: &StageContext) -> RasterResult<StageOutput> {
        let mut warnings = Vec::new();
        let files = gather_inputs(inputs, TIFF_EXTENSIONS, ctx, &mut warnings)?;
        let paths: Vec<PathBuf> = files.into_iter().map(|f| f.path).collect();

        // Step 1: Index headers; an empty set fails before anything is written
        let composite = VirtualComposite::from_paths(&paths, &self.params)?;
        warnings.extend(
            composite
                .skipped
                .iter()
                .map(|(path, reason)| format!("skipped {}: {}", path.display(), reason)),
        );

        // Step 2: Persist the virtual composite
        let dest = ctx.stage_dir()?;
        let description = dest.join(&self.params.composite_name);
        composite.to_vrt().write(&description)?;

        // Step 3: Materialise
        let pool = ctx.thread_pool()?;
        let mosaic = pool.install(|| composite.materialize(|| ctx.checkpoint()))?;
        ctx.checkpoint()?;

        let target = dest.join(&self.params.output_name);
        write_raster(&target, &mosaic)?;
        ctx.log.info(format_args!(
            "Composed {} rasters into {} ({}x{})",
            composite.sources.len(),
            target.display(),
            mosaic.width(),
            mosaic.height()
        ));

        Ok(StageOutput {
            outputs: vec![Locator::from(target)],
            warnings,
        })
    }
}

/// Publishes every input under a namespace
pub struct PublishStage {
    publication: Arc<dyn Publication>,
    namespace: String,
}

impl PublishStage {
    pub const NAME: &'static str = "publish";

    pub fn new(publication: Arc<dyn Publication>, namespace: &str) -> Self {
        Self {
            publication,
            namespace: namespace.to_string(),
        }
    }
}

impl Stage for PublishStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, inputs: &[Locator], ctx: &StageContext) -> RasterResult<StageOutput> {
        let mut output = StageOutput::default();
        for input in inputs {
            ctx.checkpoint()?;
            let path = input.path();
            if !path.is_file() {
                return Err(RasterError::unreadable(path, "nothing to publish"));
            }
            let locator = self.publication.publish(path, &self.namespace).map_err(collaborator)?;
            ctx.log.info(format_args!("Published {} as {}", path.display(), locator));
            output.outputs.push(Locator::new(locator));
        }
        Ok(output)
    }
}
