use crate::types::{RasterError, RasterResult};
use quick_xml::de::from_str;
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// GDAL VRT document describing a virtual mosaic. Only what `BuildVRT`
/// emits for a nearest-neighbour mosaic is modelled: one band element per
/// band, each listing a `SimpleSource` per input raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "VRTDataset")]
pub struct VrtDataset {
    #[serde(rename = "@rasterXSize")]
    pub raster_x_size: usize,
    #[serde(rename = "@rasterYSize")]
    pub raster_y_size: usize,
    #[serde(rename = "SRS", default, skip_serializing_if = "Option::is_none")]
    pub srs: Option<String>,
    /// Six comma-separated coefficients, GDAL order
    #[serde(rename = "GeoTransform")]
    pub geo_transform: String,
    #[serde(rename = "VRTRasterBand", default)]
    pub bands: Vec<VrtBand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VrtBand {
    #[serde(rename = "@dataType")]
    pub data_type: String,
    #[serde(rename = "@band")]
    pub band: usize,
    #[serde(rename = "NoDataValue", default, skip_serializing_if = "Option::is_none")]
    pub nodata: Option<String>,
    #[serde(rename = "SimpleSource", default)]
    pub sources: Vec<VrtSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VrtSource {
    #[serde(rename = "@resampling")]
    pub resampling: String,
    #[serde(rename = "SourceFilename")]
    pub filename: VrtFilename,
    #[serde(rename = "SourceBand")]
    pub source_band: usize,
    #[serde(rename = "SourceProperties")]
    pub properties: VrtSourceProperties,
    #[serde(rename = "SrcRect")]
    pub src_rect: VrtRect,
    #[serde(rename = "DstRect")]
    pub dst_rect: VrtRect,
    #[serde(rename = "NODATA", default, skip_serializing_if = "Option::is_none")]
    pub nodata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VrtFilename {
    #[serde(rename = "@relativeToVRT")]
    pub relative_to_vrt: u8,
    #[serde(rename = "$text")]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VrtSourceProperties {
    #[serde(rename = "@RasterXSize")]
    pub raster_x_size: usize,
    #[serde(rename = "@RasterYSize")]
    pub raster_y_size: usize,
    #[serde(rename = "@DataType")]
    pub data_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VrtRect {
    #[serde(rename = "@xOff")]
    pub x_off: f64,
    #[serde(rename = "@yOff")]
    pub y_off: f64,
    #[serde(rename = "@xSize")]
    pub x_size: f64,
    #[serde(rename = "@ySize")]
    pub y_size: f64,
}

impl VrtDataset {
    pub fn to_xml(&self) -> RasterResult<String> {
        to_string(self).map_err(|e| RasterError::Xml(format!("Failed to serialize VRT: {}", e)))
    }

    pub fn from_xml(xml: &str) -> RasterResult<Self> {
        from_str(xml).map_err(|e| RasterError::Xml(format!("Failed to parse VRT: {}", e)))
    }

    /// Persist the document; the write goes through a temporary file so the
    /// description is either complete or absent
    pub fn write<P: AsRef<Path>>(&self, path: P) -> RasterResult<()> {
        let path = path.as_ref();
        let xml = self.to_xml()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| RasterError::unwritable(path, e))?;
        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| RasterError::unwritable(path, e))?;
        std::io::Write::write_all(&mut temp, xml.as_bytes()).map_err(|e| RasterError::unwritable(path, e))?;
        temp.persist(path).map_err(|e| RasterError::unwritable(path, e.error))?;
        Ok(())
    }

    pub fn read<P: AsRef<Path>>(path: P) -> RasterResult<Self> {
        let path = path.as_ref();
        let xml = std::fs::read_to_string(path).map_err(|e| RasterError::unreadable(path, e))?;
        Self::from_xml(&xml)
    }

    /// Parsed `GeoTransform` coefficients
    pub fn geo_transform_coefficients(&self) -> RasterResult<[f64; 6]> {
        let values = self
            .geo_transform
            .split(',')
            .map(|token| token.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RasterError::Xml(format!("Invalid GeoTransform '{}': {}", self.geo_transform, e)))?;
        <[f64; 6]>::try_from(values)
            .map_err(|v| RasterError::Xml(format!("GeoTransform needs 6 coefficients, got {}", v.len())))
    }
}

/// Format geotransform coefficients the way GDAL writes them in VRT files
pub fn format_geo_transform(coefficients: &[f64; 6]) -> String {
    coefficients
        .iter()
        .map(|c| format!("{:e}", c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Format a nodata value for `NoDataValue` / `NODATA` elements
pub fn format_nodata(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        value.to_string()
    }
}
