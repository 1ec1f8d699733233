//! rasterflow: durable raster transform pipeline for satellite imagery
//!
//! Moves MODIS FAPAR HDF granules and MOSDAC GeoTIFF tiles through
//! acquisition, HDF to GeoTIFF conversion, rescaling, mosaic composition and
//! publication. The transforms are plain functions over [`types::Raster`];
//! the [`pipeline::Sequencer`] chains them with retries, timeouts and
//! cancellation, recording every completed stage under the run's storage.

pub mod types;
pub mod config;
pub mod io;
pub mod core;
pub mod pipeline;

// Re-export main types and functions for easier access
pub use types::{
    GeoTransform, Locator, MetadataAttributes, PipelineStageResult, PixelType, Raster, RasterBand,
    RasterError, RasterResult,
};
pub use config::PipelineConfig;
pub use io::{read_header, read_raster, write_raster};
pub use core::{compose, rescale, HdfConverter, MosaicParams, RescaleParams, Resampling};
pub use pipeline::{CancellationToken, RunFailure, RunOutcome, Sequencer};
