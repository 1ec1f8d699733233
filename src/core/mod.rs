//! Core raster transforms

pub mod geolocation;
pub mod normalize;
pub mod rescale;
pub mod mosaic;

// Re-export main types
pub use geolocation::{GeolocationResolver, Georeference, GeorefSource, Resolution};
pub use normalize::{normalize_samples, ConvertParams, Conversion, HdfConverter};
pub use rescale::{rescale, RescaleParams, RescaleProcessor, Resampling};
pub use mosaic::{compose, MosaicParams, MosaicSource, VirtualComposite};
