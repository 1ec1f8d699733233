use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// In-memory sample array for one band (rows x cols)
pub type BandData = Array2<f64>;

/// Numeric storage kind of a raster's samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    UInt8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
}

impl PixelType {
    /// Map a GDAL data type code (`GDALDataType`) to a pixel type
    pub fn from_gdal_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(PixelType::UInt8),
            2 => Some(PixelType::UInt16),
            3 => Some(PixelType::Int16),
            4 => Some(PixelType::UInt32),
            5 => Some(PixelType::Int32),
            6 => Some(PixelType::Float32),
            7 => Some(PixelType::Float64),
            _ => None,
        }
    }

    pub fn gdal_name(&self) -> &'static str {
        match self {
            PixelType::UInt8 => "Byte",
            PixelType::UInt16 => "UInt16",
            PixelType::Int16 => "Int16",
            PixelType::UInt32 => "UInt32",
            PixelType::Int32 => "Int32",
            PixelType::Float32 => "Float32",
            PixelType::Float64 => "Float64",
        }
    }

    pub fn from_gdal_name(name: &str) -> Option<Self> {
        match name {
            "Byte" => Some(PixelType::UInt8),
            "UInt16" => Some(PixelType::UInt16),
            "Int16" => Some(PixelType::Int16),
            "UInt32" => Some(PixelType::UInt32),
            "Int32" => Some(PixelType::Int32),
            "Float32" => Some(PixelType::Float32),
            "Float64" => Some(PixelType::Float64),
            _ => None,
        }
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, PixelType::Float32 | PixelType::Float64)
    }

    /// Inclusive value range of the type
    pub fn value_range(&self) -> (f64, f64) {
        match self {
            PixelType::UInt8 => (u8::MIN as f64, u8::MAX as f64),
            PixelType::UInt16 => (u16::MIN as f64, u16::MAX as f64),
            PixelType::Int16 => (i16::MIN as f64, i16::MAX as f64),
            PixelType::UInt32 => (u32::MIN as f64, u32::MAX as f64),
            PixelType::Int32 => (i32::MIN as f64, i32::MAX as f64),
            PixelType::Float32 => (f32::MIN as f64, f32::MAX as f64),
            PixelType::Float64 => (f64::MIN, f64::MAX),
        }
    }

    /// Whether `value` can be stored exactly as a sample of this type
    pub fn can_represent(&self, value: f64) -> bool {
        if value.is_nan() {
            return self.is_floating();
        }
        if self.is_floating() {
            return true;
        }
        let (min, max) = self.value_range();
        value.fract() == 0.0 && value >= min && value <= max
    }

    /// Floating-point counterpart used when radiometric normalization is requested
    pub fn promoted(&self) -> PixelType {
        if self.is_floating() {
            *self
        } else {
            PixelType::Float32
        }
    }

    fn bits(&self) -> u32 {
        match self {
            PixelType::UInt8 => 8,
            PixelType::UInt16 | PixelType::Int16 => 16,
            PixelType::UInt32 | PixelType::Int32 | PixelType::Float32 => 32,
            PixelType::Float64 => 64,
        }
    }

    fn is_signed(&self) -> bool {
        !matches!(self, PixelType::UInt8 | PixelType::UInt16 | PixelType::UInt32)
    }

    /// Smallest type able to hold the values of both `self` and `other`
    pub fn common(&self, other: PixelType) -> PixelType {
        if *self == other {
            return *self;
        }
        if self.is_floating() || other.is_floating() {
            let widest_int = [*self, other]
                .iter()
                .filter(|t| !t.is_floating())
                .map(|t| t.bits())
                .max()
                .unwrap_or(0);
            return if *self == PixelType::Float64 || other == PixelType::Float64 || widest_int >= 32 {
                PixelType::Float64
            } else {
                PixelType::Float32
            };
        }
        if !self.is_signed() && !other.is_signed() {
            return match self.bits().max(other.bits()) {
                8 => PixelType::UInt8,
                16 => PixelType::UInt16,
                _ => PixelType::UInt32,
            };
        }
        // an unsigned type needs twice its width to fit in a signed one
        let needed = [*self, other]
            .iter()
            .map(|t| if t.is_signed() { t.bits() } else { t.bits() * 2 })
            .max()
            .unwrap_or(64);
        match needed {
            0..=16 => PixelType::Int16,
            17..=32 => PixelType::Int32,
            _ => PixelType::Float64,
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.gdal_name())
    }
}

/// Affine mapping from pixel (col, row) to world coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(
        top_left_x: f64,
        pixel_width: f64,
        rotation_x: f64,
        top_left_y: f64,
        rotation_y: f64,
        pixel_height: f64,
    ) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x,
            top_left_y,
            rotation_y,
            pixel_height,
        }
    }

    /// GDAL's default transform for rasters without georeferencing
    pub fn identity() -> Self {
        Self::new(0.0, 1.0, 0.0, 0.0, 0.0, 1.0)
    }

    pub fn from_array(gt: [f64; 6]) -> Self {
        Self::new(gt[0], gt[1], gt[2], gt[3], gt[4], gt[5])
    }

    pub fn to_array(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// World coordinate of a (fractional) pixel position
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Fractional pixel position of a world coordinate; only valid without rotation
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.top_left_x) / self.pixel_width,
            (y - self.top_left_y) / self.pixel_height,
        )
    }

    pub fn is_rotated(&self) -> bool {
        self.rotation_x != 0.0 || self.rotation_y != 0.0
    }

    pub fn is_north_up(&self) -> bool {
        !self.is_rotated() && self.pixel_height < 0.0
    }

    /// Bounding box covered by a `width` x `height` grid
    pub fn extent(&self, width: usize, height: usize) -> Extent {
        let corners = [
            self.pixel_to_world(0.0, 0.0),
            self.pixel_to_world(width as f64, 0.0),
            self.pixel_to_world(0.0, height as f64),
            self.pixel_to_world(width as f64, height as f64),
        ];
        let mut extent = Extent::empty();
        for (x, y) in corners {
            extent.include(x, y);
        }
        extent
    }
}

impl fmt::Display for GeoTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {}, {}, {})",
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height
        )
    }
}

/// Axis-aligned bounding box in world coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn empty() -> Self {
        Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    pub fn include(&mut self, x: f64, y: f64) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    pub fn union(&self, other: &Extent) -> Extent {
        Extent {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Colour interpretation of a band, using GDAL's `GDALColorInterp` codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorInterpretation {
    #[default]
    Undefined,
    Gray,
    Palette,
    Red,
    Green,
    Blue,
    Alpha,
    Other(u32),
}

impl ColorInterpretation {
    pub fn from_gdal_code(code: u32) -> Self {
        match code {
            0 => ColorInterpretation::Undefined,
            1 => ColorInterpretation::Gray,
            2 => ColorInterpretation::Palette,
            3 => ColorInterpretation::Red,
            4 => ColorInterpretation::Green,
            5 => ColorInterpretation::Blue,
            6 => ColorInterpretation::Alpha,
            other => ColorInterpretation::Other(other),
        }
    }

    pub fn gdal_code(&self) -> u32 {
        match self {
            ColorInterpretation::Undefined => 0,
            ColorInterpretation::Gray => 1,
            ColorInterpretation::Palette => 2,
            ColorInterpretation::Red => 3,
            ColorInterpretation::Green => 4,
            ColorInterpretation::Blue => 5,
            ColorInterpretation::Alpha => 6,
            ColorInterpretation::Other(code) => *code,
        }
    }
}

/// RGBA palette attached to a paletted band
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColorTable {
    pub entries: Vec<[i16; 4]>,
}

/// One band of a raster: samples plus per-band metadata
#[derive(Debug, Clone, PartialEq)]
pub struct RasterBand {
    pub data: BandData,
    pub nodata: Option<f64>,
    pub color_interpretation: ColorInterpretation,
    pub color_table: Option<ColorTable>,
}

impl RasterBand {
    pub fn new(data: BandData) -> Self {
        Self {
            data,
            nodata: None,
            color_interpretation: ColorInterpretation::Undefined,
            color_table: None,
        }
    }

    pub fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }

    /// True if `value` carries no measurement for this band
    pub fn is_nodata(&self, value: f64) -> bool {
        if value.is_nan() {
            return true;
        }
        match self.nodata {
            Some(nd) => value == nd,
            None => false,
        }
    }

    /// Band metadata without the samples
    pub fn properties(&self) -> BandProperties {
        BandProperties {
            nodata: self.nodata,
            color_interpretation: self.color_interpretation,
            color_table: self.color_table.clone(),
        }
    }
}

/// Per-band metadata carried through transforms unchanged
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BandProperties {
    pub nodata: Option<f64>,
    pub color_interpretation: ColorInterpretation,
    pub color_table: Option<ColorTable>,
}

/// A georeferenced multi-band raster held in memory
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    width: usize,
    height: usize,
    pixel_type: PixelType,
    pub geo_transform: GeoTransform,
    pub projection: Option<String>,
    bands: Vec<RasterBand>,
}

impl Raster {
    /// Build a raster, checking that all bands share its shape and that every
    /// nodata value is representable in `pixel_type`
    pub fn new(
        pixel_type: PixelType,
        geo_transform: GeoTransform,
        projection: Option<String>,
        bands: Vec<RasterBand>,
    ) -> RasterResult<Self> {
        let first = bands
            .first()
            .ok_or_else(|| RasterError::InvalidParameter("raster needs at least one band".to_string()))?;
        let (height, width) = first.data.dim();
        if width == 0 || height == 0 {
            return Err(RasterError::InvalidParameter(format!(
                "raster dimensions must be positive, got {}x{}",
                width, height
            )));
        }

        for (index, band) in bands.iter().enumerate() {
            if band.data.dim() != (height, width) {
                return Err(RasterError::InvalidParameter(format!(
                    "band {} is {:?}, expected {:?}",
                    index + 1,
                    band.data.dim(),
                    (height, width)
                )));
            }
            if let Some(nodata) = band.nodata {
                if !pixel_type.can_represent(nodata) {
                    return Err(RasterError::InvalidParameter(format!(
                        "nodata value {} of band {} is not representable as {}",
                        nodata,
                        index + 1,
                        pixel_type
                    )));
                }
            }
        }

        Ok(Self {
            width,
            height,
            pixel_type,
            geo_transform,
            projection,
            bands,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn bands(&self) -> &[RasterBand] {
        &self.bands
    }

    /// 1-based band access, matching GDAL's numbering
    pub fn band(&self, index: usize) -> Option<&RasterBand> {
        index.checked_sub(1).and_then(|i| self.bands.get(i))
    }

    pub fn into_bands(self) -> Vec<RasterBand> {
        self.bands
    }

    pub fn extent(&self) -> Extent {
        self.geo_transform.extent(self.width, self.height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

/// Scalar attribute value attached to a source dataset
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
}

impl AttributeValue {
    /// Numbers stored as text (as GDAL reports HDF attributes) parse too
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            AttributeValue::Text(text) => text.trim().parse::<f64>().ok(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(text) => Some(text),
            AttributeValue::Number(_) => None,
        }
    }
}

/// Read-only attributes of a source dataset (fill value, scale, offset,
/// structured metadata)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataAttributes {
    values: BTreeMap<String, AttributeValue>,
}

impl MetadataAttributes {
    pub const FILL_VALUE: &'static str = "_FillValue";
    pub const SCALE_FACTOR: &'static str = "scale_factor";
    pub const ADD_OFFSET: &'static str = "add_offset";
    pub const STRUCT_METADATA: &'static str = "StructMetadata.0";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_number(mut self, name: &str, value: f64) -> Self {
        self.values.insert(name.to_string(), AttributeValue::Number(value));
        self
    }

    pub fn with_text(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), AttributeValue::Text(value.to_string()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn fill_value(&self) -> Option<f64> {
        self.get(Self::FILL_VALUE).and_then(AttributeValue::as_number)
    }

    pub fn scale_factor(&self) -> Option<f64> {
        self.get(Self::SCALE_FACTOR).and_then(AttributeValue::as_number)
    }

    pub fn add_offset(&self) -> Option<f64> {
        self.get(Self::ADD_OFFSET).and_then(AttributeValue::as_number)
    }

    pub fn struct_metadata(&self) -> Option<&str> {
        self.get(Self::STRUCT_METADATA).and_then(AttributeValue::as_text)
    }

    /// Merge `other` in without replacing attributes already present
    pub fn merge_missing(&mut self, other: &MetadataAttributes) {
        for (name, value) in &other.values {
            self.values.entry(name.clone()).or_insert_with(|| value.clone());
        }
    }
}

impl FromIterator<(String, AttributeValue)> for MetadataAttributes {
    fn from_iter<I: IntoIterator<Item = (String, AttributeValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Durable locator of a stage input or output
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem view of the locator
    pub fn path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl From<PathBuf> for Locator {
    fn from(path: PathBuf) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

impl From<&Path> for Locator {
    fn from(path: &Path) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of one successful stage attempt plus its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "stageResult")]
pub struct PipelineStageResult {
    #[serde(rename = "@stage")]
    pub stage: String,
    #[serde(rename = "@attempt")]
    pub attempt: u32,
    #[serde(rename = "input", default)]
    pub inputs: Vec<Locator>,
    #[serde(rename = "output", default)]
    pub outputs: Vec<Locator>,
    #[serde(rename = "warning", default)]
    pub warnings: Vec<String>,
    #[serde(rename = "completedAt")]
    pub completed_at: DateTime<Utc>,
}

/// Error types for raster pipeline processing
#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    #[error("Unreadable source {path}: {reason}")]
    UnreadableSource { path: PathBuf, reason: String },

    #[error("Unwritable destination {path}: {reason}")]
    UnwritableDestination { path: PathBuf, reason: String },

    #[error("Malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("Mosaic input set is empty")]
    EmptyMosaicInput,

    #[error("Stage '{stage}' timed out after {timeout:?}")]
    StageTimeout { stage: String, timeout: Duration },

    #[error("Stage '{stage}' failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        stage: String,
        attempts: u32,
        #[source]
        last: Box<RasterError>,
    },

    #[error("Required dataset '{required}' not found. Available datasets: {}", available.join(", "))]
    MissingDataset { required: String, available: Vec<String> },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Collaborator error: {0}")]
    Collaborator(#[source] anyhow::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

impl RasterError {
    pub fn unreadable(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        RasterError::UnreadableSource {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unwritable(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        RasterError::UnwritableDestination {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the sequencer may retry a stage that failed with this error
    pub fn is_retryable(&self) -> bool {
        match self {
            RasterError::UnreadableSource { .. }
            | RasterError::UnwritableDestination { .. }
            | RasterError::StageTimeout { .. }
            | RasterError::Collaborator(_)
            | RasterError::Io(_)
            | RasterError::Gdal(_) => true,
            RasterError::MalformedMetadata(_)
            | RasterError::EmptyMosaicInput
            | RasterError::RetriesExhausted { .. }
            | RasterError::MissingDataset { .. }
            | RasterError::InvalidParameter(_)
            | RasterError::Cancelled
            | RasterError::Config(_)
            | RasterError::Xml(_) => false,
        }
    }
}

/// Result type for raster operations
pub type RasterResult<T> = Result<T, RasterError>;
