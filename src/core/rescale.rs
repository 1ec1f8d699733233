use crate::types::{BandData, GeoTransform, Raster, RasterBand, RasterError, RasterResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pixel resampling algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Resampling {
    /// Smooth interpolation for continuous radiometric fields
    #[default]
    Bilinear,
    /// Value of the covering source pixel; keeps categorical values intact
    Nearest,
}

impl Resampling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resampling::Bilinear => "bilinear",
            Resampling::Nearest => "nearest",
        }
    }
}

impl FromStr for Resampling {
    type Err = RasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bilinear" => Ok(Resampling::Bilinear),
            "nearest" => Ok(Resampling::Nearest),
            other => Err(RasterError::InvalidParameter(format!("unknown resampling '{}'", other))),
        }
    }
}

impl TryFrom<String> for Resampling {
    type Error = RasterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resampling> for String {
    fn from(value: Resampling) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Resampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rescale parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RescaleParams {
    /// Output pixels per input pixel along each axis (< 1 downsamples)
    pub scale_factor: f64,
    pub resampling: Resampling,
    /// Store the output as floating point regardless of the input type
    pub promote_to_float: bool,
}

impl Default for RescaleParams {
    fn default() -> Self {
        Self {
            scale_factor: 0.5,
            resampling: Resampling::Bilinear,
            promote_to_float: false,
        }
    }
}

/// Changes the pixel density of a raster while keeping its ground origin
pub struct RescaleProcessor {
    params: RescaleParams,
}

impl RescaleProcessor {
    /// Create a new rescale processor
    pub fn new(params: RescaleParams) -> RasterResult<Self> {
        let s = params.scale_factor;
        if !s.is_finite() || s <= 0.0 {
            return Err(RasterError::InvalidParameter(format!(
                "scale factor must be a positive number, got {}",
                s
            )));
        }
        Ok(Self { params })
    }

    pub fn params(&self) -> &RescaleParams {
        &self.params
    }

    /// Output dimensions: `floor(width * s)` x `floor(height * s)`
    pub fn output_size(&self, width: usize, height: usize) -> (usize, usize) {
        let s = self.params.scale_factor;
        ((width as f64 * s).floor() as usize, (height as f64 * s).floor() as usize)
    }

    /// Geotransform of the rescaled grid: same origin, pixel terms divided by `s`
    pub fn output_geo_transform(&self, gt: &GeoTransform) -> GeoTransform {
        let s = self.params.scale_factor;
        GeoTransform::new(
            gt.top_left_x,
            gt.pixel_width / s,
            gt.rotation_x / s,
            gt.top_left_y,
            gt.rotation_y / s,
            gt.pixel_height / s,
        )
    }

    /// Rescale every band of `raster`
    pub fn rescale(&self, raster: &Raster) -> RasterResult<Raster> {
        let (out_width, out_height) = self.output_size(raster.width(), raster.height());
        if out_width == 0 || out_height == 0 {
            return Err(RasterError::InvalidParameter(format!(
                "scale factor {} turns {}x{} into an empty raster",
                self.params.scale_factor,
                raster.width(),
                raster.height()
            )));
        }

        log::info!(
            "Rescaling {}x{} -> {}x{} ({}, {} bands)",
            raster.width(),
            raster.height(),
            out_width,
            out_height,
            self.params.resampling,
            raster.band_count()
        );

        let bands = self.resample_bands(raster.bands(), (out_height, out_width));
        let pixel_type = if self.params.promote_to_float {
            raster.pixel_type().promoted()
        } else {
            raster.pixel_type()
        };

        Raster::new(
            pixel_type,
            self.output_geo_transform(&raster.geo_transform),
            raster.projection.clone(),
            bands,
        )
    }

    #[cfg(feature = "parallel")]
    fn resample_bands(&self, bands: &[RasterBand], shape: (usize, usize)) -> Vec<RasterBand> {
        use rayon::prelude::*;

        bands.par_iter().map(|band| self.resample_band(band, shape)).collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn resample_bands(&self, bands: &[RasterBand], shape: (usize, usize)) -> Vec<RasterBand> {
        bands.iter().map(|band| self.resample_band(band, shape)).collect()
    }

    /// Resample one band; nodata, colour interpretation and colour table are
    /// copied forward unchanged
    pub fn resample_band(&self, band: &RasterBand, shape: (usize, usize)) -> RasterBand {
        let data = match self.params.resampling {
            Resampling::Bilinear => self.bilinear(band, shape),
            Resampling::Nearest => self.nearest(band, shape),
        };
        RasterBand {
            data,
            nodata: band.nodata,
            color_interpretation: band.color_interpretation,
            color_table: band.color_table.clone(),
        }
    }

    /// Source coordinate of an output pixel centre, in source pixel units
    fn source_position(&self, out_index: usize) -> f64 {
        (out_index as f64 + 0.5) / self.params.scale_factor
    }

    fn fill_value(band: &RasterBand) -> f64 {
        band.nodata.unwrap_or(f64::NAN)
    }

    fn nearest(&self, band: &RasterBand, (out_height, out_width): (usize, usize)) -> BandData {
        let (height, width) = band.data.dim();
        Array2::from_shape_fn((out_height, out_width), |(i, j)| {
            let row = (self.source_position(i).floor() as usize).min(height - 1);
            let col = (self.source_position(j).floor() as usize).min(width - 1);
            band.data[[row, col]]
        })
    }

    /// Bilinear interpolation over pixel centres. Neighbours carrying nodata
    /// are dropped and the remaining weights renormalised.
    fn bilinear(&self, band: &RasterBand, (out_height, out_width): (usize, usize)) -> BandData {
        let (height, width) = band.data.dim();
        let fill = Self::fill_value(band);

        Array2::from_shape_fn((out_height, out_width), |(i, j)| {
            let y = (self.source_position(i) - 0.5).clamp(0.0, (height - 1) as f64);
            let x = (self.source_position(j) - 0.5).clamp(0.0, (width - 1) as f64);

            let y1 = y.floor() as usize;
            let x1 = x.floor() as usize;
            let y2 = (y1 + 1).min(height - 1);
            let x2 = (x1 + 1).min(width - 1);
            let dy = y - y1 as f64;
            let dx = x - x1 as f64;

            let neighbours = [
                (band.data[[y1, x1]], (1.0 - dx) * (1.0 - dy)),
                (band.data[[y1, x2]], dx * (1.0 - dy)),
                (band.data[[y2, x1]], (1.0 - dx) * dy),
                (band.data[[y2, x2]], dx * dy),
            ];

            let mut sum = 0.0;
            let mut weight = 0.0;
            for (value, w) in neighbours {
                if w > 0.0 && !band.is_nodata(value) {
                    sum += value * w;
                    weight += w;
                }
            }

            if weight > 0.0 {
                sum / weight
            } else {
                fill
            }
        })
    }
}

/// Rescale `raster` by `params`
pub fn rescale(raster: &Raster, params: &RescaleParams) -> RasterResult<Raster> {
    RescaleProcessor::new(params.clone())?.rescale(raster)
}
