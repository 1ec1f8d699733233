//! I/O modules for reading and writing rasters, HDF granules and VRT descriptions

pub mod raster_io;
pub mod hdf;
pub mod vrt;

pub use raster_io::{read_header, read_raster, write_raster, RasterHandle, RasterHeader};
pub use hdf::{HdfGranule, Subdataset};
pub use vrt::VrtDataset;
