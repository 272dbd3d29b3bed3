//! Mosaic and clip over tiles written to disk.

use approx::assert_relative_eq;
use chrono::Utc;
use demfetch_dem::{
    BoundingBox, CacheEntry, CoordinateNormalizer, Crs, DemError, DemRaster, MosaicEngine,
    Polygon, RasterFormat, RemoteMeta, ResamplingMethod, SourceId, TileId, NODATA_VALUE,
};
use std::path::Path;

/// 10x10 tile at 0.01° whose value is 1000 × (pixel centre lon - origin).
fn gradient_tile(dir: &Path, name: &str, bounds: BoundingBox, origin: f64, void: Option<(u32, u32)>) -> CacheEntry {
    let mut data = Vec::with_capacity(100);
    for row in 0..10u32 {
        for col in 0..10u32 {
            let lon = bounds.min_x + (col as f64 + 0.5) * 0.01;
            let value = if void == Some((col, row)) {
                -32768.0
            } else {
                ((lon - origin) * 1000.0) as f32
            };
            data.push(value);
        }
    }
    let raster = DemRaster::new(name.to_string(), data, 10, 10, bounds, Crs::WGS84, Some(-32768.0)).unwrap();
    let path = dir.join(format!("{}.tif", name));
    raster.write_geotiff(&path).unwrap();

    CacheEntry {
        source: SourceId::new("test"),
        tile_id: TileId::new(name),
        size_bytes: std::fs::metadata(&path).unwrap().len(),
        local_path: path,
        fetched_at: Utc::now(),
        source_ref: String::new(),
        format: RasterFormat::GeoTiff,
        validator: RemoteMeta::default(),
    }
}

fn two_tiles(dir: &Path) -> Vec<CacheEntry> {
    vec![
        gradient_tile(dir, "west", BoundingBox::new(-118.2, 34.0, -118.1, 34.1), -118.2, Some((0, 0))),
        gradient_tile(dir, "east", BoundingBox::new(-118.1, 34.0, -118.0, 34.1), -118.2, None),
    ]
}

#[test]
fn test_adjacent_tiles_are_continuous() {
    let tiles_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let entries = two_tiles(tiles_dir.path());
    let engine = MosaicEngine::new(CoordinateNormalizer::default(), out_dir.path());
    let polygon = Polygon::from_bbox(&BoundingBox::new(-118.2, 34.0, -118.0, 34.1));

    let output = engine
        .build(&entries, &polygon, ResamplingMethod::Bilinear, "job_test")
        .unwrap();
    let artifact = &output.artifact;

    assert_eq!(output.tiles, 2);
    assert!(output.warnings.is_empty());
    assert_eq!(artifact.path, out_dir.path().join("job_test.tif"));
    assert_eq!(artifact.crs, Crs::WGS84);
    assert_eq!((artifact.width, artifact.height), (20, 10));
    assert_eq!(artifact.nodata_value, NODATA_VALUE);
    // One HGT-style void in the west tile
    assert_eq!(artifact.valid_pixels, 199);

    let raster = DemRaster::from_file(&artifact.path).unwrap();
    assert_eq!(raster.nodata(), Some(NODATA_VALUE));
    assert_eq!(raster.data()[0], NODATA_VALUE);

    // Across the seam between columns 9 and 10
    let row = 5;
    assert_relative_eq!(raster.pixel(9, row).unwrap(), 95.0, epsilon = 1e-2);
    assert_relative_eq!(raster.pixel(10, row).unwrap(), 105.0, epsilon = 1e-2);
    for col in 1..19 {
        let step = raster.pixel(col + 1, row).unwrap() - raster.pixel(col, row).unwrap();
        assert_relative_eq!(step, 10.0, epsilon = 1e-2);
    }
}

#[test]
fn test_artifact_bounds_are_polygon_bbox_within_tiles() {
    let tiles_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let entries = two_tiles(tiles_dir.path());
    let engine = MosaicEngine::new(CoordinateNormalizer::default(), out_dir.path());

    // Extends past the tiles on the east and north
    let polygon = Polygon::from_bbox(&BoundingBox::new(-118.15, 34.05, -117.5, 34.5));
    let output = engine
        .build(&entries, &polygon, ResamplingMethod::Bilinear, "partial")
        .unwrap();

    let bounds = output.artifact.bounds;
    assert_relative_eq!(bounds.min_x, -118.15, epsilon = 1e-9);
    assert_relative_eq!(bounds.min_y, 34.05, epsilon = 1e-9);
    assert_relative_eq!(bounds.max_x, -118.0, epsilon = 1e-9);
    assert_relative_eq!(bounds.max_y, 34.1, epsilon = 1e-9);
    assert_eq!((output.artifact.width, output.artifact.height), (15, 5));
}

#[test]
fn test_clip_respects_holes() {
    let tiles_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let entries = two_tiles(tiles_dir.path());
    let engine = MosaicEngine::new(CoordinateNormalizer::default(), out_dir.path());

    let polygon = Polygon::new(
        vec![(-118.2, 34.0), (-118.0, 34.0), (-118.0, 34.1), (-118.2, 34.1)],
        vec![vec![(-118.13, 34.03), (-118.07, 34.03), (-118.07, 34.07), (-118.13, 34.07)]],
    )
    .unwrap();
    let output = engine
        .build(&entries, &polygon, ResamplingMethod::Nearest, "holed")
        .unwrap();

    // 6x4 pixel centres fall inside the hole
    assert_eq!(output.artifact.valid_pixels, 199 - 24);
    let raster = DemRaster::from_file(&output.artifact.path).unwrap();
    assert_eq!(raster.pixel(10, 5), None);
    assert!(raster.pixel(2, 5).is_some());
}

#[test]
fn test_polygon_outside_tiles_is_empty_result() {
    let tiles_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let entries = two_tiles(tiles_dir.path());
    let engine = MosaicEngine::new(CoordinateNormalizer::default(), out_dir.path());

    let polygon = Polygon::from_bbox(&BoundingBox::new(-100.0, 10.0, -99.0, 11.0));
    let err = engine
        .build(&entries, &polygon, ResamplingMethod::Bilinear, "empty")
        .unwrap_err();
    assert!(matches!(err, DemError::EmptyResult));
    assert!(!out_dir.path().join("empty.tif").exists());
}

#[test]
fn test_projected_tile_is_normalized() {
    let tiles_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();

    // 1 km square in PT-TM06/ETRS89 near Lisbon
    let bounds = BoundingBox::new(-88_000.0, -106_000.0, -87_000.0, -105_000.0);
    let raster = DemRaster::new("pt".into(), vec![50.0; 400], 20, 20, bounds, Crs::from_epsg(3763), None).unwrap();
    let path = tiles_dir.path().join("pt.tif");
    raster.write_geotiff(&path).unwrap();
    let entry = CacheEntry {
        source: SourceId::new("lidar"),
        tile_id: TileId::new("pt"),
        size_bytes: std::fs::metadata(&path).unwrap().len(),
        local_path: path,
        fetched_at: Utc::now(),
        source_ref: String::new(),
        format: RasterFormat::GeoTiff,
        validator: RemoteMeta::default(),
    };

    let engine = MosaicEngine::new(CoordinateNormalizer::default(), out_dir.path());
    let canonical = engine
        .normalizer()
        .bbox_to_canonical(&bounds, Crs::from_epsg(3763))
        .unwrap();
    let polygon = Polygon::from_bbox(&canonical);
    let output = engine
        .build(&[entry], &polygon, ResamplingMethod::Bilinear, "pt")
        .unwrap();

    assert_eq!(output.artifact.crs, Crs::WGS84);
    assert!(output.artifact.valid_pixels > 0);
    let out = DemRaster::from_file(&output.artifact.path).unwrap();
    assert!(out
        .data()
        .iter()
        .filter(|v| **v != NODATA_VALUE)
        .all(|v| (*v - 50.0).abs() < 1e-3));
}
