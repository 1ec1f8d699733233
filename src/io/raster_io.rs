use crate::types::{
    BandData, BandProperties, ColorInterpretation, ColorTable, GeoTransform, PixelType, Raster,
    RasterBand, RasterError, RasterResult,
};
use gdal::raster::{Buffer, ColorInterpretation as GdalColorInterpretation, GdalType, RasterBand as GdalBand};
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use num_traits::{NumCast, Zero};
use std::os::raw::c_int;
use std::path::{Path, PathBuf};

/// Header information of a raster, read without touching pixel data
#[derive(Debug, Clone, PartialEq)]
pub struct RasterHeader {
    pub path: PathBuf,
    pub width: usize,
    pub height: usize,
    pub band_count: usize,
    pub pixel_type: PixelType,
    pub geo_transform: Option<GeoTransform>,
    pub projection: Option<String>,
    pub nodata: Vec<Option<f64>>,
}

/// Open GDAL dataset plus the bookkeeping needed to convert samples.
///
/// The dataset is closed when the handle is dropped, so every exit path
/// releases it; `close` makes the flush explicit.
pub struct RasterHandle {
    dataset: Dataset,
    path: PathBuf,
    pixel_type: PixelType,
}

impl RasterHandle {
    /// Open an existing raster container
    pub fn open<P: AsRef<Path>>(path: P) -> RasterResult<Self> {
        let path = path.as_ref();
        let dataset = Dataset::open(path).map_err(|e| RasterError::unreadable(path, e))?;

        let (width, height) = dataset.raster_size();
        let band_count = dataset.raster_count() as usize;
        if width == 0 || height == 0 || band_count == 0 {
            return Err(RasterError::unreadable(
                path,
                format!("container reports {}x{} pixels and {} bands", width, height, band_count),
            ));
        }

        let band = dataset.rasterband(1).map_err(|e| RasterError::unreadable(path, e))?;
        let code = band.band_type() as u32;
        let pixel_type = PixelType::from_gdal_code(code).ok_or_else(|| {
            RasterError::unreadable(path, format!("unsupported GDAL data type code {}", code))
        })?;

        log::debug!("Opened {} ({}x{}, {} bands, {})", path.display(), width, height, band_count, pixel_type);

        Ok(Self {
            dataset,
            path: path.to_path_buf(),
            pixel_type,
        })
    }

    /// Create a new GeoTIFF, replacing any file at `path`
    pub fn create<P: AsRef<Path>>(
        path: P,
        width: usize,
        height: usize,
        band_count: usize,
        pixel_type: PixelType,
    ) -> RasterResult<Self> {
        let path = path.as_ref();
        if width == 0 || height == 0 || band_count == 0 {
            return Err(RasterError::unwritable(
                path,
                format!("cannot create {}x{} raster with {} bands", width, height, band_count),
            ));
        }

        let driver = DriverManager::get_driver_by_name("GTiff")
            .map_err(|e| RasterError::unwritable(path, e))?;
        let (w, h, b) = (width as isize, height as isize, band_count as isize);

        let created = match pixel_type {
            PixelType::UInt8 => driver.create_with_band_type::<u8, _>(path, w, h, b),
            PixelType::UInt16 => driver.create_with_band_type::<u16, _>(path, w, h, b),
            PixelType::Int16 => driver.create_with_band_type::<i16, _>(path, w, h, b),
            PixelType::UInt32 => driver.create_with_band_type::<u32, _>(path, w, h, b),
            PixelType::Int32 => driver.create_with_band_type::<i32, _>(path, w, h, b),
            PixelType::Float32 => driver.create_with_band_type::<f32, _>(path, w, h, b),
            PixelType::Float64 => driver.create_with_band_type::<f64, _>(path, w, h, b),
        };
        let dataset = created.map_err(|e| RasterError::unwritable(path, e))?;

        log::debug!("Created {} ({}x{}, {} bands, {})", path.display(), width, height, band_count, pixel_type);

        Ok(Self {
            dataset,
            path: path.to_path_buf(),
            pixel_type,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// (width, height) in pixels
    pub fn dimensions(&self) -> (usize, usize) {
        self.dataset.raster_size()
    }

    pub fn band_count(&self) -> usize {
        self.dataset.raster_count() as usize
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    fn band(&self, index: usize) -> RasterResult<GdalBand<'_>> {
        if index == 0 || index > self.band_count() {
            return Err(RasterError::InvalidParameter(format!(
                "band {} out of range 1..={} for {}",
                index,
                self.band_count(),
                self.path.display()
            )));
        }
        Ok(self.dataset.rasterband(index as isize)?)
    }

    /// Read all samples of a band (1-based index)
    pub fn read_band(&self, index: usize) -> RasterResult<BandData> {
        let band = self.band(index)?;
        let (width, height) = self.dimensions();
        let buffer = band
            .read_as::<f64>((0, 0), (width, height), (width, height), None)
            .map_err(|e| RasterError::unreadable(&self.path, e))?;

        Array2::from_shape_vec((height, width), buffer.data)
            .map_err(|e| RasterError::unreadable(&self.path, format!("Failed to reshape band {}: {}", index, e)))
    }

    /// Write all samples of a band, converting to the handle's pixel type.
    /// For integer types NaN samples become `nodata` (or 0).
    pub fn write_band(&mut self, index: usize, data: &BandData, nodata: Option<f64>) -> RasterResult<()> {
        let (width, height) = self.dimensions();
        if data.dim() != (height, width) {
            return Err(RasterError::InvalidParameter(format!(
                "band data is {:?}, raster is {:?}",
                data.dim(),
                (height, width)
            )));
        }

        match self.pixel_type {
            PixelType::UInt8 => self.write_typed::<u8>(index, data, nodata),
            PixelType::UInt16 => self.write_typed::<u16>(index, data, nodata),
            PixelType::Int16 => self.write_typed::<i16>(index, data, nodata),
            PixelType::UInt32 => self.write_typed::<u32>(index, data, nodata),
            PixelType::Int32 => self.write_typed::<i32>(index, data, nodata),
            PixelType::Float32 => self.write_typed::<f32>(index, data, nodata),
            PixelType::Float64 => self.write_typed::<f64>(index, data, nodata),
        }
    }

    fn write_typed<T: GdalType + NumCast + Zero + Copy>(
        &mut self,
        index: usize,
        data: &BandData,
        nodata: Option<f64>,
    ) -> RasterResult<()> {
        let (width, height) = self.dimensions();
        let samples = encode_samples::<T>(data, self.pixel_type, nodata);
        let mut band = self.band(index)?;
        let buffer = Buffer::new((width, height), samples);
        band.write((0, 0), (width, height), &buffer)
            .map_err(|e| RasterError::unwritable(&self.path, e))
    }

    /// Nodata, colour interpretation and colour table of a band
    pub fn band_properties(&self, index: usize) -> RasterResult<BandProperties> {
        let band = self.band(index)?;
        let nodata = band.no_data_value();

        let color_interpretation = ColorInterpretation::from_gdal_code(band.color_interpretation().c_int() as u32);
        let color_table = unsafe {
            let table = gdal_sys::GDALGetRasterColorTable(band.c_rasterband());
            if table.is_null() {
                None
            } else {
                Some(read_color_table(table))
            }
        };

        Ok(BandProperties {
            nodata,
            color_interpretation,
            color_table,
        })
    }

    /// Apply band metadata; an undefined colour interpretation is left as GDAL set it
    pub fn set_band_properties(&mut self, index: usize, properties: &BandProperties) -> RasterResult<()> {
        let path = self.path.clone();
        let mut band = self.band(index)?;

        if let Some(nodata) = properties.nodata {
            band.set_no_data_value(Some(nodata))
                .map_err(|e| RasterError::unwritable(&path, e))?;
        }

        if let Some(table) = &properties.color_table {
            unsafe {
                let handle = band.c_rasterband();
                let c_table = gdal_sys::GDALCreateColorTable(gdal_sys::GDALPaletteInterp::GPI_RGB);
                for (i, entry) in table.entries.iter().enumerate() {
                    let c_entry = gdal_sys::GDALColorEntry {
                        c1: entry[0],
                        c2: entry[1],
                        c3: entry[2],
                        c4: entry[3],
                    };
                    gdal_sys::GDALSetColorEntry(c_table, i as c_int, &c_entry);
                }
                let err = gdal_sys::GDALSetRasterColorTable(handle, c_table);
                gdal_sys::GDALDestroyColorTable(c_table);
                if err != gdal_sys::CPLErr::CE_None {
                    return Err(RasterError::unwritable(
                        &path,
                        format!("cannot set colour table on band {}", index),
                    ));
                }
            }
        }

        // a colour table already implies palette interpretation
        let interp = properties.color_interpretation;
        let implied = interp == ColorInterpretation::Palette && properties.color_table.is_some();
        if interp != ColorInterpretation::Undefined && !implied {
            let stored = GdalColorInterpretation::from_c_int(interp.gdal_code() as _)
                .map(|gdal_interp| band.set_color_interpretation(gdal_interp).is_ok())
                .unwrap_or(false);
            if !stored {
                log::warn!("{} does not store colour interpretation {:?} for band {}", path.display(), interp, index);
            }
        }

        Ok(())
    }

    /// Geotransform and projection from the dataset header.
    /// GDAL reports a missing projection as an empty string.
    pub fn georeference(&self) -> (Option<GeoTransform>, Option<String>) {
        let geo_transform = self.dataset.geo_transform().ok().map(GeoTransform::from_array);
        let wkt = self.dataset.projection();
        let projection = if wkt.trim().is_empty() { None } else { Some(wkt) };
        (geo_transform, projection)
    }

    pub fn set_georeference(&mut self, geo_transform: &GeoTransform, projection: Option<&str>) -> RasterResult<()> {
        self.dataset
            .set_geo_transform(&geo_transform.to_array())
            .map_err(|e| RasterError::unwritable(&self.path, e))?;
        if let Some(wkt) = projection {
            self.dataset
                .set_projection(wkt)
                .map_err(|e| RasterError::unwritable(&self.path, e))?;
        }
        Ok(())
    }

    pub fn header(&self) -> RasterResult<RasterHeader> {
        let (width, height) = self.dimensions();
        let (geo_transform, projection) = self.georeference();
        let nodata = (1..=self.band_count())
            .map(|index| self.band(index).map(|band| band.no_data_value()))
            .collect::<RasterResult<Vec<_>>>()?;

        Ok(RasterHeader {
            path: self.path.clone(),
            width,
            height,
            band_count: self.band_count(),
            pixel_type: self.pixel_type,
            geo_transform,
            projection,
            nodata,
        })
    }

    /// Flush buffered writes and release the dataset. Once this returns the
    /// file is complete on disk.
    pub fn close(self) -> RasterResult<()> {
        unsafe {
            let _ = gdal_sys::GDALFlushCache(self.dataset.c_dataset());
        }
        log::debug!("Closed {}", self.path.display());
        drop(self.dataset);
        Ok(())
    }
}

unsafe fn read_color_table(table: gdal_sys::GDALColorTableH) -> ColorTable {
    let count = gdal_sys::GDALGetColorEntryCount(table);
    let mut entries = Vec::with_capacity(count.max(0) as usize);
    for i in 0..count {
        let entry = gdal_sys::GDALGetColorEntry(table, i);
        if !entry.is_null() {
            let entry = &*entry;
            entries.push([entry.c1, entry.c2, entry.c3, entry.c4]);
        }
    }
    ColorTable { entries }
}

/// Convert in-memory samples to the storage type. Finite values are clamped
/// to the type's range; integer targets are also rounded.
fn encode_samples<T: NumCast + Zero + Copy>(data: &BandData, pixel_type: PixelType, nodata: Option<f64>) -> Vec<T> {
    let (min, max) = pixel_type.value_range();
    let floating = pixel_type.is_floating();
    data.iter()
        .map(|&value| {
            let value = if floating {
                if value.is_finite() {
                    value.clamp(min, max)
                } else {
                    value
                }
            } else if value.is_nan() {
                nodata.unwrap_or(0.0)
            } else {
                value.round().clamp(min, max)
            };
            T::from(value).unwrap_or_else(T::zero)
        })
        .collect()
}

/// Read only the header of a raster
pub fn read_header<P: AsRef<Path>>(path: P) -> RasterResult<RasterHeader> {
    let handle = RasterHandle::open(path)?;
    let header = handle.header()?;
    handle.close()?;
    Ok(header)
}

/// Read a whole raster into memory. A missing geotransform becomes GDAL's
/// default identity transform.
pub fn read_raster<P: AsRef<Path>>(path: P) -> RasterResult<Raster> {
    let path = path.as_ref();
    let handle = RasterHandle::open(path)?;
    let pixel_type = handle.pixel_type();
    let (geo_transform, projection) = handle.georeference();
    let geo_transform = geo_transform.unwrap_or_else(|| {
        log::debug!("{} has no geotransform, using identity", path.display());
        GeoTransform::identity()
    });

    let mut bands = Vec::with_capacity(handle.band_count());
    for index in 1..=handle.band_count() {
        let properties = handle.band_properties(index)?;
        let data = handle.read_band(index)?;
        let nodata = properties.nodata.filter(|nd| {
            let representable = pixel_type.can_represent(*nd);
            if !representable {
                log::warn!("Ignoring nodata {} of band {} in {}: not a {} value", nd, index, path.display(), pixel_type);
            }
            representable
        });
        bands.push(RasterBand {
            data,
            nodata,
            color_interpretation: properties.color_interpretation,
            color_table: properties.color_table,
        });
    }
    handle.close()?;

    Raster::new(pixel_type, geo_transform, projection, bands)
}

/// Write a raster as GeoTIFF at `path`.
///
/// GDAL writes into a temporary file in the destination directory which is
/// renamed over `path` only after the dataset is closed, so readers never see
/// a partial file and a failed write leaves nothing behind.
pub fn write_raster<P: AsRef<Path>>(path: P, raster: &Raster) -> RasterResult<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| RasterError::unwritable(path, e))?;

    let temp_path = tempfile::Builder::new()
        .prefix(".partial-")
        .suffix(".tif")
        .tempfile_in(dir)
        .map_err(|e| RasterError::unwritable(path, e))?
        .into_temp_path();

    let mut handle = RasterHandle::create(
        &temp_path,
        raster.width(),
        raster.height(),
        raster.band_count(),
        raster.pixel_type(),
    )?;
    handle.set_georeference(&raster.geo_transform, raster.projection.as_deref())?;
    for (i, band) in raster.bands().iter().enumerate() {
        handle.write_band(i + 1, &band.data, band.nodata)?;
        handle.set_band_properties(i + 1, &band.properties())?;
    }
    handle.close()?;

    temp_path
        .persist(path)
        .map_err(|e| RasterError::unwritable(path, e.error))?;

    log::info!("Wrote {}x{} raster to {}", raster.width(), raster.height(), path.display());
    Ok(())
}
