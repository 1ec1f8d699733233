use crate::types::{GeoTransform, MetadataAttributes, RasterError};
use regex::Regex;
use std::sync::OnceLock;

/// MODIS sinusoidal grid used by the land products (MCD15A2H etc.)
pub const SINUSOIDAL_WKT: &str = r#"PROJCS["Sinusoidal",GEOGCS["GCS_WGS_1984",DATUM["WGS_1984",SPHEROID["WGS_84",6378137,298.257223563]],PRIMEM["Greenwich",0],UNIT["Degree",0.017453292519943295]],PROJECTION["Sinusoidal"],PARAMETER["longitude_of_center",0],PARAMETER["false_easting",0],PARAMETER["false_northing",0],UNIT["Meter",1]]"#;

/// Geographic WGS84, used with the global fallback transform
pub const WGS84_WKT: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563]],PRIMEM["Greenwich",0],UNIT["degree",0.0174532925199433]]"#;

/// Global-extent transform used when no georeference can be derived
pub const FALLBACK_GEO_TRANSFORM: GeoTransform = GeoTransform {
    top_left_x: -180.0,
    pixel_width: 0.005,
    rotation_x: 0.0,
    top_left_y: 90.0,
    rotation_y: 0.0,
    pixel_height: -0.005,
};

/// Where a resolved georeference came from
#[derive(Debug, Clone, PartialEq)]
pub enum GeorefSource {
    /// Corner coordinates of the structured metadata descriptor
    StructMetadata,
    /// Geotransform already present in the dataset header
    DatasetHeader,
    /// Documented global fallback
    Fallback,
}

/// Geotransform plus projection for a raster
#[derive(Debug, Clone, PartialEq)]
pub struct Georeference {
    pub geo_transform: GeoTransform,
    pub projection: String,
    pub source: GeorefSource,
}

/// Result of resolving a georeference. `warning` is set whenever the
/// fallback was used; it never aborts the pipeline.
#[derive(Debug)]
pub struct Resolution {
    pub georeference: Georeference,
    pub warning: Option<RasterError>,
}

impl Resolution {
    pub fn is_fallback(&self) -> bool {
        self.georeference.source == GeorefSource::Fallback
    }
}

/// Derives geotransforms from embedded product metadata
pub struct GeolocationResolver {
    upper_left: &'static Regex,
    lower_right: &'static Regex,
}

fn corner_pattern(key: &str) -> Regex {
    // Capture whatever sits between the parentheses; numeric validation
    // happens afterwards so malformed tokens become parse failures.
    let pattern = format!(r"{}\s*=\s*\(\s*([^,()]*?)\s*,\s*([^,()]*?)\s*\)", regex::escape(key));
    Regex::new(&pattern).unwrap_or_else(|e| panic!("invalid corner pattern for {}: {}", key, e))
}

static UPPER_LEFT: OnceLock<Regex> = OnceLock::new();
static LOWER_RIGHT: OnceLock<Regex> = OnceLock::new();

impl Default for GeolocationResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl GeolocationResolver {
    pub fn new() -> Self {
        Self {
            upper_left: UPPER_LEFT.get_or_init(|| corner_pattern("UpperLeftPointMtrs")),
            lower_right: LOWER_RIGHT.get_or_init(|| corner_pattern("LowerRightMtrs")),
        }
    }

    /// Resolve from the structured metadata descriptor, or fall back to the
    /// global extent with a `MalformedMetadata` warning
    pub fn resolve(&self, attributes: &MetadataAttributes, width: usize, height: usize) -> Resolution {
        match attributes.struct_metadata() {
            Some(descriptor) => match self.parse_descriptor(descriptor, width, height) {
                Ok(geo_transform) => {
                    log::debug!("Resolved geotransform {} from structured metadata", geo_transform);
                    Resolution {
                        georeference: Georeference {
                            geo_transform,
                            projection: SINUSOIDAL_WKT.to_string(),
                            source: GeorefSource::StructMetadata,
                        },
                        warning: None,
                    }
                }
                Err(reason) => Self::fallback(reason),
            },
            None => Self::fallback(format!("no {} attribute", MetadataAttributes::STRUCT_METADATA)),
        }
    }

    /// Like `resolve`, but a dataset without any descriptor keeps the
    /// georeference from its own header when it has a real one
    pub fn resolve_with_header(
        &self,
        attributes: &MetadataAttributes,
        header: (Option<GeoTransform>, Option<String>),
        width: usize,
        height: usize,
    ) -> Resolution {
        if attributes.struct_metadata().is_none() {
            if let (Some(geo_transform), Some(projection)) = header {
                if geo_transform != GeoTransform::identity() {
                    log::debug!("Using geotransform {} from dataset header", geo_transform);
                    return Resolution {
                        georeference: Georeference {
                            geo_transform,
                            projection,
                            source: GeorefSource::DatasetHeader,
                        },
                        warning: None,
                    };
                }
            }
        }
        self.resolve(attributes, width, height)
    }

    fn parse_descriptor(&self, descriptor: &str, width: usize, height: usize) -> Result<GeoTransform, String> {
        if width == 0 || height == 0 {
            return Err(format!("cannot derive pixel size for {}x{} raster", width, height));
        }
        let (ul_x, ul_y) = Self::corner(self.upper_left, descriptor, "UpperLeftPointMtrs")?;
        let (lr_x, lr_y) = Self::corner(self.lower_right, descriptor, "LowerRightMtrs")?;

        let pixel_width = (lr_x - ul_x) / width as f64;
        let pixel_height = (ul_y - lr_y) / height as f64;
        if pixel_width == 0.0 || pixel_height == 0.0 {
            return Err(format!(
                "degenerate corners ({}, {}) / ({}, {})",
                ul_x, ul_y, lr_x, lr_y
            ));
        }

        Ok(GeoTransform::new(ul_x, pixel_width, 0.0, ul_y, 0.0, -pixel_height))
    }

    fn corner(pattern: &Regex, descriptor: &str, key: &str) -> Result<(f64, f64), String> {
        let captures = pattern
            .captures(descriptor)
            .ok_or_else(|| format!("{} not found", key))?;
        let parse = |token: &str| -> Result<f64, String> {
            token
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| format!("{} has malformed coordinate '{}'", key, token))
        };
        Ok((parse(&captures[1])?, parse(&captures[2])?))
    }

    fn fallback(reason: String) -> Resolution {
        log::warn!("Could not extract proper geotransform from metadata ({}). Using default values.", reason);
        Resolution {
            georeference: Georeference {
                geo_transform: FALLBACK_GEO_TRANSFORM,
                projection: WGS84_WKT.to_string(),
                source: GeorefSource::Fallback,
            },
            warning: Some(RasterError::MalformedMetadata(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const H25V06: &str = "GROUP=SwathStructure\nEND_GROUP=SwathStructure\nGROUP=GridStructure\n\tGROUP=GRID_1\n\t\tGridName=\"MOD_Grid_MOD15A2H\"\n\t\tXDim=2400\n\t\tYDim=2400\n\t\tUpperLeftPointMtrs=(7783653.637667,3335851.559000)\n\t\tLowerRightMtrs=(8895604.157333,2223901.039333)\n\t\tProjection=GCTP_SNSOID\n";

    fn attrs(descriptor: &str) -> MetadataAttributes {
        MetadataAttributes::new().with_text(MetadataAttributes::STRUCT_METADATA, descriptor)
    }

    #[test]
    fn test_resolves_modis_tile_corners() {
        let resolution = GeolocationResolver::new().resolve(&attrs(H25V06), 2400, 2400);
        assert!(resolution.warning.is_none());

        let gt = resolution.georeference.geo_transform;
        assert_relative_eq!(gt.top_left_x, 7783653.637667);
        assert_relative_eq!(gt.top_left_y, 3335851.559);
        assert_relative_eq!(gt.pixel_width, 463.312716527, epsilon = 1e-6);
        assert_relative_eq!(gt.pixel_height, -463.312716527, epsilon = 1e-6);
        assert_eq!(gt.rotation_x, 0.0);
        assert_eq!(resolution.georeference.projection, SINUSOIDAL_WKT);
        assert_eq!(resolution.georeference.source, GeorefSource::StructMetadata);
    }

    #[test]
    fn test_pixel_size_uses_width_and_height_separately() {
        let descriptor = "UpperLeftPointMtrs=(0.0,100.0) LowerRightMtrs=(200.0,0.0)";
        let gt = GeolocationResolver::new().resolve(&attrs(descriptor), 20, 5).georeference.geo_transform;
        assert_eq!(gt.pixel_width, 10.0);
        assert_eq!(gt.pixel_height, -20.0);
    }

    #[test]
    fn test_integer_and_signed_coordinates() {
        let descriptor = "UpperLeftPointMtrs=(-20015109,10007555) LowerRightMtrs=(+20015109,-10007555)";
        let resolution = GeolocationResolver::new().resolve(&attrs(descriptor), 100, 50);
        assert!(!resolution.is_fallback());
        assert_eq!(resolution.georeference.geo_transform.top_left_x, -20015109.0);
    }

    #[test]
    fn test_missing_lower_right_falls_back() {
        let descriptor = "UpperLeftPointMtrs=(7783653.637667,3335851.559000)";
        let resolution = GeolocationResolver::new().resolve(&attrs(descriptor), 2400, 2400);

        assert!(resolution.is_fallback());
        assert_eq!(resolution.georeference.geo_transform, GeoTransform::new(-180.0, 0.005, 0.0, 90.0, 0.0, -0.005));
        assert_eq!(resolution.georeference.projection, WGS84_WKT);
        assert!(matches!(resolution.warning, Some(RasterError::MalformedMetadata(_))));
    }

    #[test]
    fn test_malformed_number_falls_back() {
        let descriptor = "UpperLeftPointMtrs=(77836x53.6,3335851.5) LowerRightMtrs=(8895604.1,2223901.0)";
        let resolution = GeolocationResolver::new().resolve(&attrs(descriptor), 2400, 2400);
        assert!(resolution.is_fallback());
    }

    #[test]
    fn test_absent_descriptor_falls_back() {
        let resolution = GeolocationResolver::new().resolve(&MetadataAttributes::new(), 10, 10);
        assert!(resolution.is_fallback());
        assert!(resolution.warning.is_some());
    }

    #[test]
    fn test_header_used_only_without_descriptor() {
        let resolver = GeolocationResolver::new();
        let header_gt = GeoTransform::new(10.0, 1.0, 0.0, 20.0, 0.0, -1.0);
        let header = (Some(header_gt), Some(WGS84_WKT.to_string()));

        let resolution = resolver.resolve_with_header(&MetadataAttributes::new(), header.clone(), 4, 4);
        assert_eq!(resolution.georeference.source, GeorefSource::DatasetHeader);
        assert_eq!(resolution.georeference.geo_transform, header_gt);

        let broken = attrs("UpperLeftPointMtrs=(1,2)");
        let resolution = resolver.resolve_with_header(&broken, header, 4, 4);
        assert!(resolution.is_fallback());
    }

    #[test]
    fn test_identity_header_is_not_a_georeference() {
        let header = (Some(GeoTransform::identity()), Some(WGS84_WKT.to_string()));
        let resolution = GeolocationResolver::new().resolve_with_header(&MetadataAttributes::new(), header, 4, 4);
        assert!(resolution.is_fallback());
    }
}
