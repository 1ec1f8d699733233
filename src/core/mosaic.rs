use crate::io::raster_io::{read_header, read_raster, RasterHeader};
use crate::io::vrt::{
    format_geo_transform, format_nodata, VrtBand, VrtDataset, VrtFilename, VrtRect, VrtSource,
    VrtSourceProperties,
};
use crate::types::{
    BandData, ColorInterpretation, ColorTable, Extent, GeoTransform, PixelType, Raster, RasterBand,
    RasterError, RasterResult,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Mosaic parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MosaicParams {
    /// File name of the composed raster
    pub output_name: String,
    /// File name of the persisted virtual composite
    pub composite_name: String,
    /// Overrides the nodata value derived from the sources
    pub nodata: Option<f64>,
}

impl Default for MosaicParams {
    fn default() -> Self {
        Self {
            output_name: "composed_output.tif".to_string(),
            composite_name: "composite.vrt".to_string(),
            nodata: None,
        }
    }
}

/// One input tile of a composite
#[derive(Debug, Clone, PartialEq)]
pub struct MosaicSource {
    pub path: PathBuf,
    pub width: usize,
    pub height: usize,
    pub band_count: usize,
    pub pixel_type: PixelType,
    pub geo_transform: GeoTransform,
    pub projection: Option<String>,
    pub nodata: Vec<Option<f64>>,
    pub extent: Extent,
}

/// Ordered, header-only description of a mosaic.
///
/// Built from headers alone: the ordered sources, the union extent and the
/// finest resolution. Materialising renders it into one north-up raster,
/// applying sources in order so later tiles overwrite earlier ones where
/// they overlap.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualComposite {
    /// Sources in overlap priority order; the last one wins
    pub sources: Vec<MosaicSource>,
    pub extent: Extent,
    /// Finest absolute pixel sizes among the sources
    pub resolution: (f64, f64),
    pub width: usize,
    pub height: usize,
    pub band_count: usize,
    pub pixel_type: PixelType,
    pub projection: Option<String>,
    pub nodata: f64,
    /// Inputs left out of the composite, with the reason
    pub skipped: Vec<(PathBuf, String)>,
}

/// Number of cells of size `resolution` needed to cover `span`
fn grid_cells(span: f64, resolution: f64) -> usize {
    let cells = span / resolution;
    let rounded = cells.round();
    let cells = if (cells - rounded).abs() < 1e-6 { rounded } else { cells.ceil() };
    (cells as usize).max(1)
}

impl VirtualComposite {
    /// Index the rasters at `paths`, reading headers only
    pub fn from_paths<P: AsRef<Path>>(paths: &[P], params: &MosaicParams) -> RasterResult<Self> {
        let headers = paths
            .iter()
            .map(|path| read_header(path))
            .collect::<RasterResult<Vec<_>>>()?;
        Self::build(headers, params)
    }

    /// Build the composite from headers, in the given order
    pub fn build(headers: Vec<RasterHeader>, params: &MosaicParams) -> RasterResult<Self> {
        let mut sources: Vec<MosaicSource> = Vec::with_capacity(headers.len());
        let mut skipped = Vec::new();

        for header in headers {
            let reason = match header.geo_transform {
                None => Some("no geotransform".to_string()),
                Some(gt) if gt.is_rotated() => Some(format!("rotated geotransform {}", gt)),
                Some(_) => match sources.first() {
                    Some(first) if first.band_count != header.band_count => Some(format!(
                        "{} bands, composite has {}",
                        header.band_count, first.band_count
                    )),
                    _ => None,
                },
            };

            if let Some(reason) = reason {
                log::warn!("Skipping mosaic source {}: {}", header.path.display(), reason);
                skipped.push((header.path, reason));
                continue;
            }

            let geo_transform = header.geo_transform.unwrap_or_else(GeoTransform::identity);
            if let Some(first) = sources.first() {
                if first.projection != header.projection {
                    log::warn!(
                        "Projection of {} differs from {}; composing without reprojection",
                        header.path.display(),
                        first.path.display()
                    );
                }
            }

            sources.push(MosaicSource {
                extent: geo_transform.extent(header.width, header.height),
                path: header.path,
                width: header.width,
                height: header.height,
                band_count: header.band_count,
                pixel_type: header.pixel_type,
                geo_transform,
                projection: header.projection,
                nodata: header.nodata,
            });
        }

        let Some(first) = sources.first() else {
            return Err(RasterError::EmptyMosaicInput);
        };

        let extent = sources.iter().fold(Extent::empty(), |acc, s| acc.union(&s.extent));
        let resolution = sources.iter().fold((f64::INFINITY, f64::INFINITY), |(x, y), s| {
            (x.min(s.geo_transform.pixel_width.abs()), y.min(s.geo_transform.pixel_height.abs()))
        });
        let pixel_type = sources
            .iter()
            .skip(1)
            .fold(first.pixel_type, |acc, s| acc.common(s.pixel_type));

        let nodata = Self::composite_nodata(params.nodata, first.nodata.first().copied().flatten(), pixel_type);

        let composite = Self {
            width: grid_cells(extent.width(), resolution.0),
            height: grid_cells(extent.height(), resolution.1),
            band_count: first.band_count,
            projection: first.projection.clone(),
            sources,
            extent,
            resolution,
            pixel_type,
            nodata,
            skipped,
        };

        log::info!(
            "Indexed {} mosaic sources ({} skipped) into {}x{} {} composite",
            composite.sources.len(),
            composite.skipped.len(),
            composite.width,
            composite.height,
            composite.pixel_type
        );
        Ok(composite)
    }

    /// Nodata of the composite: explicit override, else the first source's,
    /// else NaN for floating types and 0 for integers
    fn composite_nodata(explicit: Option<f64>, first: Option<f64>, pixel_type: PixelType) -> f64 {
        explicit
            .or(first)
            .filter(|value| pixel_type.can_represent(*value))
            .unwrap_or(if pixel_type.is_floating() { f64::NAN } else { 0.0 })
    }

    /// North-up geotransform of the composite grid
    pub fn geo_transform(&self) -> GeoTransform {
        GeoTransform::new(
            self.extent.min_x,
            self.resolution.0,
            0.0,
            self.extent.max_y,
            0.0,
            -self.resolution.1,
        )
    }

    /// Output window `(col0, row0, col1, row1)` covered by a source, clipped
    fn window(&self, source: &MosaicSource) -> (usize, usize, usize, usize) {
        let (res_x, res_y) = self.resolution;
        let clip = |v: f64, max: usize| (v.max(0.0) as usize).min(max);
        (
            clip(((source.extent.min_x - self.extent.min_x) / res_x).floor(), self.width),
            clip(((self.extent.max_y - source.extent.max_y) / res_y).floor(), self.height),
            clip(((source.extent.max_x - self.extent.min_x) / res_x).ceil(), self.width),
            clip(((self.extent.max_y - source.extent.min_y) / res_y).ceil(), self.height),
        )
    }

    /// Render the composite, reading each source with `read_raster`.
    ///
    /// `checkpoint` runs before each source; an error from it aborts the
    /// composition.
    pub fn materialize<C>(&self, checkpoint: C) -> RasterResult<Raster>
    where
        C: Fn() -> RasterResult<()>,
    {
        self.materialize_with(|path| read_raster(path), checkpoint)
    }

    /// Render the composite with a caller-supplied source reader
    pub fn materialize_with<R, C>(&self, mut read: R, checkpoint: C) -> RasterResult<Raster>
    where
        R: FnMut(&Path) -> RasterResult<Raster>,
        C: Fn() -> RasterResult<()>,
    {
        let target = self.geo_transform();
        let mut canvas: Vec<BandData> = (0..self.band_count)
            .map(|_| Array2::from_elem((self.height, self.width), self.nodata))
            .collect();
        let mut styles: Vec<(ColorInterpretation, Option<ColorTable>)> =
            vec![(ColorInterpretation::Undefined, None); self.band_count];

        for (index, source) in self.sources.iter().enumerate() {
            checkpoint()?;

            let raster = read(&source.path)?;
            if raster.band_count() != self.band_count {
                return Err(RasterError::unreadable(
                    &source.path,
                    format!("expected {} bands, found {}", self.band_count, raster.band_count()),
                ));
            }
            if index == 0 {
                styles = raster
                    .bands()
                    .iter()
                    .map(|b| (b.color_interpretation, b.color_table.clone()))
                    .collect();
            }

            let window = self.window(source);
            log::debug!("Painting {} into window {:?}", source.path.display(), window);
            paint_bands(&mut canvas, &raster, &target, window);
        }

        let bands = canvas
            .into_iter()
            .zip(styles)
            .map(|(data, (color_interpretation, color_table))| RasterBand {
                data,
                nodata: Some(self.nodata),
                color_interpretation,
                color_table,
            })
            .collect();

        Raster::new(self.pixel_type, target, self.projection.clone(), bands)
    }

    /// VRT description of the composite, one `SimpleSource` per tile and band
    pub fn to_vrt(&self) -> VrtDataset {
        let (res_x, res_y) = self.resolution;
        let bands = (1..=self.band_count)
            .map(|band| VrtBand {
                data_type: self.pixel_type.gdal_name().to_string(),
                band,
                nodata: Some(format_nodata(self.nodata)),
                sources: self
                    .sources
                    .iter()
                    .map(|source| VrtSource {
                        resampling: "nearest".to_string(),
                        filename: VrtFilename {
                            relative_to_vrt: 0,
                            path: source.path.to_string_lossy().into_owned(),
                        },
                        source_band: band,
                        properties: VrtSourceProperties {
                            raster_x_size: source.width,
                            raster_y_size: source.height,
                            data_type: source.pixel_type.gdal_name().to_string(),
                        },
                        src_rect: VrtRect {
                            x_off: 0.0,
                            y_off: 0.0,
                            x_size: source.width as f64,
                            y_size: source.height as f64,
                        },
                        dst_rect: VrtRect {
                            x_off: (source.extent.min_x - self.extent.min_x) / res_x,
                            y_off: (self.extent.max_y - source.extent.max_y) / res_y,
                            x_size: source.extent.width() / res_x,
                            y_size: source.extent.height() / res_y,
                        },
                        nodata: source.nodata.get(band - 1).copied().flatten().map(format_nodata),
                    })
                    .collect(),
            })
            .collect();

        VrtDataset {
            raster_x_size: self.width,
            raster_y_size: self.height,
            srs: self.projection.clone(),
            geo_transform: format_geo_transform(&self.geo_transform().to_array()),
            bands,
        }
    }

    /// Rebuild a composite from a persisted VRT description. Source
    /// geotransforms are recovered from the destination windows, so they
    /// come back north-up.
    pub fn from_vrt(vrt: &VrtDataset) -> RasterResult<Self> {
        let gt = GeoTransform::from_array(vrt.geo_transform_coefficients()?);
        let resolution = (gt.pixel_width.abs(), gt.pixel_height.abs());
        let first_band = vrt
            .bands
            .first()
            .ok_or_else(|| RasterError::Xml("VRT has no bands".to_string()))?;
        let pixel_type = PixelType::from_gdal_name(&first_band.data_type)
            .ok_or_else(|| RasterError::Xml(format!("unknown data type {}", first_band.data_type)))?;
        let nodata = match first_band.nodata.as_deref() {
            Some(text) => parse_nodata(text)?,
            None => Self::composite_nodata(None, None, pixel_type),
        };

        let mut sources = Vec::with_capacity(first_band.sources.len());
        for (i, entry) in first_band.sources.iter().enumerate() {
            let source_type = PixelType::from_gdal_name(&entry.properties.data_type).ok_or_else(|| {
                RasterError::Xml(format!("unknown data type {}", entry.properties.data_type))
            })?;
            let width = entry.properties.raster_x_size;
            let height = entry.properties.raster_y_size;
            let geo_transform = GeoTransform::new(
                gt.top_left_x + entry.dst_rect.x_off * resolution.0,
                entry.dst_rect.x_size * resolution.0 / width as f64,
                0.0,
                gt.top_left_y - entry.dst_rect.y_off * resolution.1,
                0.0,
                -(entry.dst_rect.y_size * resolution.1 / height as f64),
            );
            let nodata = vrt
                .bands
                .iter()
                .map(|band| match band.sources.get(i).and_then(|s| s.nodata.as_deref()) {
                    Some(text) => parse_nodata(text).map(Some),
                    None => Ok(None),
                })
                .collect::<RasterResult<Vec<_>>>()?;

            sources.push(MosaicSource {
                path: PathBuf::from(&entry.filename.path),
                width,
                height,
                band_count: vrt.bands.len(),
                pixel_type: source_type,
                extent: geo_transform.extent(width, height),
                geo_transform,
                projection: vrt.srs.clone(),
                nodata,
            });
        }

        if sources.is_empty() {
            return Err(RasterError::EmptyMosaicInput);
        }

        Ok(Self {
            extent: gt.extent(vrt.raster_x_size, vrt.raster_y_size),
            resolution,
            width: vrt.raster_x_size,
            height: vrt.raster_y_size,
            band_count: vrt.bands.len(),
            pixel_type,
            projection: vrt.srs.clone(),
            nodata,
            sources,
            skipped: Vec::new(),
        })
    }
}

fn parse_nodata(text: &str) -> RasterResult<f64> {
    text.trim()
        .parse::<f64>()
        .map_err(|e| RasterError::Xml(format!("invalid nodata '{}': {}", text, e)))
}

/// Paint one source over the canvas inside `window`, nearest neighbour at
/// output pixel centres. Source nodata pixels leave the canvas untouched.
fn paint_bands(canvas: &mut [BandData], raster: &Raster, target: &GeoTransform, window: (usize, usize, usize, usize)) {
    let paint = |(out, band): (&mut BandData, &RasterBand)| {
        let (col0, row0, col1, row1) = window;
        let (height, width) = band.data.dim();
        let source_gt = &raster.geo_transform;

        for row in row0..row1 {
            for col in col0..col1 {
                let (x, y) = target.pixel_to_world(col as f64 + 0.5, row as f64 + 0.5);
                let (src_col, src_row) = source_gt.world_to_pixel(x, y);
                if src_col < 0.0 || src_row < 0.0 {
                    continue;
                }
                let (src_col, src_row) = (src_col.floor() as usize, src_row.floor() as usize);
                if src_col >= width || src_row >= height {
                    continue;
                }
                let value = band.data[[src_row, src_col]];
                if !band.is_nodata(value) {
                    out[[row, col]] = value;
                }
            }
        }
    };

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        canvas.par_iter_mut().zip(raster.bands().par_iter()).for_each(paint);
    }

    #[cfg(not(feature = "parallel"))]
    canvas.iter_mut().zip(raster.bands().iter()).for_each(paint);
}

/// Index and materialise `paths` in one go
pub fn compose<P: AsRef<Path>>(paths: &[P], params: &MosaicParams) -> RasterResult<Raster> {
    VirtualComposite::from_paths(paths, params)?.materialize(|| Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn header(name: &str, gt: GeoTransform, size: usize, nodata: Option<f64>) -> RasterHeader {
        RasterHeader {
            path: PathBuf::from(name),
            width: size,
            height: size,
            band_count: 1,
            pixel_type: PixelType::Float32,
            geo_transform: Some(gt),
            projection: Some("EPSG:4326".to_string()),
            nodata: vec![nodata],
        }
    }

    fn tile(gt: GeoTransform, size: usize, value: f64, nodata: Option<f64>) -> Raster {
        let band = RasterBand::new(Array2::from_elem((size, size), value)).with_nodata(nodata);
        Raster::new(PixelType::Float32, gt, Some("EPSG:4326".to_string()), vec![band]).unwrap()
    }

    fn render(composite: &VirtualComposite, tiles: HashMap<&str, Raster>) -> Raster {
        composite
            .materialize_with(
                |path| Ok(tiles[path.to_str().unwrap()].clone()),
                || Ok(()),
            )
            .unwrap()
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let result = VirtualComposite::build(Vec::new(), &MosaicParams::default());
        assert!(matches!(result, Err(RasterError::EmptyMosaicInput)));
    }

    #[test]
    fn test_all_sources_skipped_is_empty() {
        let rotated = GeoTransform::new(0.0, 1.0, 0.2, 10.0, 0.1, -1.0);
        let result = VirtualComposite::build(vec![header("r.tif", rotated, 10, None)], &MosaicParams::default());
        assert!(matches!(result, Err(RasterError::EmptyMosaicInput)));
    }

    #[test]
    fn test_quadrants_compose_to_union_extent() {
        let gts = [
            ("nw", GeoTransform::new(0.0, 1.0, 0.0, 200.0, 0.0, -1.0), 1.0),
            ("ne", GeoTransform::new(100.0, 1.0, 0.0, 200.0, 0.0, -1.0), 2.0),
            ("sw", GeoTransform::new(0.0, 1.0, 0.0, 100.0, 0.0, -1.0), 3.0),
            ("se", GeoTransform::new(100.0, 1.0, 0.0, 100.0, 0.0, -1.0), 4.0),
        ];
        let headers = gts.iter().map(|(n, gt, _)| header(n, *gt, 100, None)).collect();
        let composite = VirtualComposite::build(headers, &MosaicParams::default()).unwrap();
        assert_eq!((composite.width, composite.height), (200, 200));

        let tiles = gts.iter().map(|(n, gt, v)| (*n, tile(*gt, 100, *v, None))).collect();
        let mosaic = render(&composite, tiles);
        let data = &mosaic.band(1).unwrap().data;

        assert_eq!(mosaic.geo_transform, GeoTransform::new(0.0, 1.0, 0.0, 200.0, 0.0, -1.0));
        assert_eq!(data[[0, 0]], 1.0);
        assert_eq!(data[[50, 150]], 2.0);
        assert_eq!(data[[150, 50]], 3.0);
        assert_eq!(data[[199, 199]], 4.0);
    }

    #[test]
    fn test_overlap_last_writer_wins() {
        let a = GeoTransform::new(0.0, 1.0, 0.0, 10.0, 0.0, -1.0);
        let b = GeoTransform::new(5.0, 1.0, 0.0, 10.0, 0.0, -1.0);

        let forward = VirtualComposite::build(
            vec![header("a", a, 10, None), header("b", b, 10, None)],
            &MosaicParams::default(),
        )
        .unwrap();
        let tiles = || HashMap::from([("a", tile(a, 10, 1.0, None)), ("b", tile(b, 10, 2.0, None))]);
        let data = render(&forward, tiles()).band(1).unwrap().data.clone();
        assert_eq!(data.dim(), (10, 15));
        assert_eq!(data[[0, 2]], 1.0);
        assert_eq!(data[[0, 7]], 2.0);

        let reversed = VirtualComposite::build(
            vec![header("b", b, 10, None), header("a", a, 10, None)],
            &MosaicParams::default(),
        )
        .unwrap();
        let data = render(&reversed, tiles()).band(1).unwrap().data.clone();
        assert_eq!(data[[0, 7]], 1.0);
        assert_eq!(data[[0, 12]], 2.0);
    }

    #[test]
    fn test_source_nodata_is_transparent() {
        let gt = GeoTransform::new(0.0, 1.0, 0.0, 4.0, 0.0, -1.0);
        let composite = VirtualComposite::build(
            vec![header("base", gt, 4, None), header("holes", gt, 4, Some(-1.0))],
            &MosaicParams::default(),
        )
        .unwrap();
        let mut holes = tile(gt, 4, 9.0, Some(-1.0));
        let mut data = holes.band(1).unwrap().data.clone();
        data[[0, 0]] = -1.0;
        holes = Raster::new(PixelType::Float32, gt, None, vec![RasterBand::new(data).with_nodata(Some(-1.0))]).unwrap();

        let out = render(&composite, HashMap::from([("base", tile(gt, 4, 5.0, None)), ("holes", holes)]));
        let data = &out.band(1).unwrap().data;
        assert_eq!(data[[0, 0]], 5.0);
        assert_eq!(data[[1, 1]], 9.0);
    }

    #[test]
    fn test_gaps_hold_composite_nodata() {
        let a = GeoTransform::new(0.0, 1.0, 0.0, 2.0, 0.0, -1.0);
        let b = GeoTransform::new(4.0, 1.0, 0.0, 2.0, 0.0, -1.0);
        let composite = VirtualComposite::build(
            vec![header("a", a, 2, None), header("b", b, 2, None)],
            &MosaicParams::default(),
        )
        .unwrap();
        assert!(composite.nodata.is_nan());

        let out = render(&composite, HashMap::from([("a", tile(a, 2, 1.0, None)), ("b", tile(b, 2, 1.0, None))]));
        let band = out.band(1).unwrap();
        assert!(band.data[[0, 2]].is_nan());
        assert!(band.nodata.unwrap().is_nan());
    }

    #[test]
    fn test_integer_composite_nodata_defaults() {
        assert_eq!(VirtualComposite::composite_nodata(None, None, PixelType::UInt8), 0.0);
        assert_eq!(VirtualComposite::composite_nodata(None, Some(255.0), PixelType::UInt8), 255.0);
        assert_eq!(VirtualComposite::composite_nodata(Some(7.0), Some(255.0), PixelType::UInt8), 7.0);
    }

    #[test]
    fn test_finest_resolution_and_band_mismatch() {
        let coarse = GeoTransform::new(0.0, 2.0, 0.0, 10.0, 0.0, -2.0);
        let fine = GeoTransform::new(0.0, 1.0, 0.0, 10.0, 0.0, -1.0);
        let mut three_bands = header("rgb", fine, 10, None);
        three_bands.band_count = 3;

        let composite = VirtualComposite::build(
            vec![header("coarse", coarse, 5, None), header("fine", fine, 10, None), three_bands],
            &MosaicParams::default(),
        )
        .unwrap();
        assert_eq!(composite.resolution, (1.0, 1.0));
        assert_eq!(composite.sources.len(), 2);
        assert_eq!(composite.skipped.len(), 1);
        assert_eq!((composite.width, composite.height), (10, 10));
    }

    #[test]
    fn test_cancellation_between_sources() {
        let gt = GeoTransform::new(0.0, 1.0, 0.0, 2.0, 0.0, -1.0);
        let composite = VirtualComposite::build(vec![header("a", gt, 2, None)], &MosaicParams::default()).unwrap();
        let result = composite.materialize_with(|_| Ok(tile(gt, 2, 1.0, None)), || Err(RasterError::Cancelled));
        assert!(matches!(result, Err(RasterError::Cancelled)));
    }

    #[test]
    fn test_vrt_description_rebuilds_composite() {
        let a = GeoTransform::new(0.0, 1.0, 0.0, 10.0, 0.0, -1.0);
        let b = GeoTransform::new(10.0, 1.0, 0.0, 10.0, 0.0, -1.0);
        let composite = VirtualComposite::build(
            vec![header("/t/a.tif", a, 10, Some(-1.0)), header("/t/b.tif", b, 10, None)],
            &MosaicParams::default(),
        )
        .unwrap();

        let vrt = composite.to_vrt();
        assert_eq!(vrt.bands[0].sources[1].dst_rect.x_off, 10.0);

        let rebuilt = VirtualComposite::from_vrt(&VrtDataset::from_xml(&vrt.to_xml().unwrap()).unwrap()).unwrap();
        assert_eq!(rebuilt.width, 20);
        assert_eq!(rebuilt.sources[1].geo_transform, b);
        assert_eq!(rebuilt.sources[0].nodata, vec![Some(-1.0)]);
        assert_eq!(rebuilt.nodata, composite.nodata);
    }
}
