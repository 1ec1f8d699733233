use approx::assert_relative_eq;
use ndarray::Array2;
use rasterflow::core::rescale::{RescaleParams, Resampling};
use rasterflow::pipeline::{CancellationToken, RescaleStage, RunStorage, Stage, StageContext};
use rasterflow::types::{ColorInterpretation, ColorTable, GeoTransform, Locator, PixelType, Raster, RasterBand};
use rasterflow::{read_raster, write_raster};
use std::path::Path;
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write_ramp(path: &Path, width: usize, height: usize) -> Raster {
    let data = Array2::from_shape_fn((height, width), |(r, c)| ((r * width + c) % 250) as f64);
    let mut band = RasterBand::new(data).with_nodata(Some(255.0));
    band.color_interpretation = ColorInterpretation::Palette;
    band.color_table = Some(ColorTable {
        entries: vec![[0, 0, 0, 255], [255, 255, 255, 255]],
    });
    let raster = Raster::new(
        PixelType::UInt8,
        GeoTransform::new(68.0, 0.04, 0.0, 38.0, 0.0, -0.04),
        None,
        vec![band],
    )
    .unwrap();
    write_raster(path, &raster).unwrap();
    raster
}

fn context(root: &Path, concurrency: usize) -> StageContext {
    let storage = RunStorage::new(root, "run-rescale").unwrap();
    StageContext::new(
        storage,
        RescaleStage::NAME,
        1,
        concurrency,
        CancellationToken::new(),
        CancellationToken::new(),
    )
}

#[test]
fn test_rescale_stage_halves_tiles_in_folder() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("input");
    write_ramp(&input.join("2025/01/PAR_a.tif"), 101, 60);
    write_ramp(&input.join("PAR_b.tiff"), 40, 40);
    std::fs::write(input.join("PAR.txt"), b"not a raster").unwrap();

    let stage = RescaleStage::new(RescaleParams::default()).unwrap();
    let ctx = context(&temp.path().join("runs"), 2);
    let output = stage.run(&[Locator::from(input.as_path())], &ctx).unwrap();

    assert_eq!(output.outputs.len(), 2);
    let first = output.outputs[0].path();
    assert!(first.ends_with("run-rescale/rescale/2025/01/PAR_a.tif"));

    let rescaled = read_raster(first).unwrap();
    assert_eq!((rescaled.width(), rescaled.height()), (50, 30));
    assert_eq!(rescaled.pixel_type(), PixelType::UInt8);
    assert_relative_eq!(rescaled.geo_transform.pixel_width, 0.08);
    assert_relative_eq!(rescaled.geo_transform.pixel_height, -0.08);
    assert_eq!(rescaled.geo_transform.top_left_x, 68.0);

    let band = rescaled.band(1).unwrap();
    assert_eq!(band.nodata, Some(255.0));
    assert_eq!(band.color_interpretation, ColorInterpretation::Palette);
    assert_eq!(band.color_table.as_ref().unwrap().entries.len(), 2);
}

#[test]
fn test_unit_scale_is_numeric_identity() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("tile.tif");
    let original = write_ramp(&source, 33, 17);

    let stage = RescaleStage::new(RescaleParams {
        scale_factor: 1.0,
        resampling: Resampling::Bilinear,
        promote_to_float: false,
    })
    .unwrap();
    let ctx = context(&temp.path().join("runs"), 1);
    let output = stage.run(&[Locator::from(source.as_path())], &ctx).unwrap();

    let copy = read_raster(output.outputs[0].path()).unwrap();
    assert_eq!(copy.geo_transform, original.geo_transform);
    assert_eq!(copy.band(1).unwrap().data, original.band(1).unwrap().data);
}

#[test]
fn test_rerun_overwrites_identical_output() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("tile.tif");
    write_ramp(&source, 64, 64);

    let stage = RescaleStage::new(RescaleParams::default()).unwrap();
    let ctx = context(&temp.path().join("runs"), 4);
    let inputs = [Locator::from(source.as_path())];

    let first = stage.run(&inputs, &ctx).unwrap();
    let before = read_raster(first.outputs[0].path()).unwrap();
    let second = stage.run(&inputs, &ctx).unwrap();
    let after = read_raster(second.outputs[0].path()).unwrap();

    assert_eq!(first.outputs, second.outputs);
    assert_eq!(before.band(1).unwrap().data, after.band(1).unwrap().data);

    let files: Vec<_> = std::fs::read_dir(ctx.stage_dir().unwrap()).unwrap().collect();
    assert_eq!(files.len(), 1);
}

#[test]
fn test_cancelled_attempt_writes_nothing() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("tile.tif");
    write_ramp(&source, 16, 16);

    let storage = RunStorage::new(temp.path().join("runs"), "run-cancel").unwrap();
    let attempt = CancellationToken::new();
    attempt.cancel();
    let ctx = StageContext::new(storage, RescaleStage::NAME, 1, 1, CancellationToken::new(), attempt);

    let stage = RescaleStage::new(RescaleParams::default()).unwrap();
    assert!(stage.run(&[Locator::from(source.as_path())], &ctx).is_err());
    assert!(!ctx.stage_dir().unwrap().join("tile.tif").exists());
}
