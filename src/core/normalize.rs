use crate::core::geolocation::{GeolocationResolver, Georeference};
use crate::io::hdf::HdfGranule;
use crate::io::raster_io::write_raster;
use crate::types::{
    BandData, ColorInterpretation, MetadataAttributes, PixelType, Raster, RasterBand, RasterError, RasterResult,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Apply fill substitution, scale and offset, in that order.
///
/// Samples equal to `_FillValue` become NaN; the rest become
/// `add_offset + scale_factor * v`. Missing attributes are skipped.
pub fn normalize_samples(samples: &BandData, attributes: &MetadataAttributes) -> BandData {
    let fill_value = attributes.fill_value();
    let scale_factor = attributes.scale_factor();
    let add_offset = attributes.add_offset();

    log::debug!(
        "Normalizing samples: fill={:?} scale={:?} offset={:?}",
        fill_value,
        scale_factor,
        add_offset
    );

    samples.mapv(|v| {
        let mut value = match fill_value {
            Some(fill) if v == fill => f64::NAN,
            _ => v,
        };
        if let Some(scale) = scale_factor {
            value *= scale;
        }
        if let Some(offset) = add_offset {
            value += offset;
        }
        value
    })
}

/// Build the single-band Float32 raster written for a converted granule
pub fn normalized_raster(
    samples: &BandData,
    attributes: &MetadataAttributes,
    georeference: &Georeference,
) -> RasterResult<Raster> {
    let mut band = RasterBand::new(normalize_samples(samples, attributes)).with_nodata(Some(f64::NAN));
    band.color_interpretation = ColorInterpretation::Gray;
    Raster::new(
        PixelType::Float32,
        georeference.geo_transform,
        Some(georeference.projection.clone()),
        vec![band],
    )
}

/// Parameters of the HDF to GeoTIFF conversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertParams {
    /// Science dataset to extract from each granule
    pub dataset_name: String,
}

impl Default for ConvertParams {
    fn default() -> Self {
        Self {
            dataset_name: "Fpar_500m".to_string(),
        }
    }
}

/// Outcome of converting one granule
#[derive(Debug)]
pub struct Conversion {
    pub output: PathBuf,
    pub georeference: Georeference,
    /// Non-fatal problems, e.g. the geolocation fallback
    pub warnings: Vec<RasterError>,
}

/// Extracts one science dataset from an HDF granule into a georeferenced
/// Float32 GeoTIFF
pub struct HdfConverter {
    params: ConvertParams,
    resolver: GeolocationResolver,
}

impl HdfConverter {
    pub fn new(params: ConvertParams) -> Self {
        Self {
            params,
            resolver: GeolocationResolver::new(),
        }
    }

    /// Output file name for a granule: `<granule stem>.tif`
    pub fn output_name(hdf_path: &Path) -> String {
        let stem = hdf_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "granule".to_string());
        format!("{}.tif", stem)
    }

    /// Convert `hdf_path`, writing `<output_dir>/<granule stem>.tif`
    pub fn convert<P: AsRef<Path>, Q: AsRef<Path>>(&self, hdf_path: P, output_dir: Q) -> RasterResult<Conversion> {
        let hdf_path = hdf_path.as_ref();
        let output = output_dir.as_ref().join(Self::output_name(hdf_path));

        // Step 1: Select the dataset and its attributes
        let granule = HdfGranule::open(hdf_path)?;
        let (handle, attributes) = granule.open_subdataset(&self.params.dataset_name)?;
        let (width, height) = handle.dimensions();
        let header = handle.georeference();
        let samples = handle.read_band(1)?;
        handle.close()?;

        log::info!(
            "Read {} ({}x{}) from {}",
            self.params.dataset_name,
            width,
            height,
            hdf_path.display()
        );

        // Step 2: Georeference
        let resolution = self.resolver.resolve_with_header(&attributes, header, width, height);
        let warnings = resolution.warning.into_iter().collect::<Vec<_>>();
        let georeference = resolution.georeference;

        // Step 3: Normalize values and write
        let raster = normalized_raster(&samples, &attributes, &georeference)?;
        write_raster(&output, &raster)?;

        log::info!("Successfully converted HDF to GeoTIFF: {}", output.display());
        Ok(Conversion {
            output,
            georeference,
            warnings,
        })
    }
}
