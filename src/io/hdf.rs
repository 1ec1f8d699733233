use crate::io::raster_io::RasterHandle;
use crate::types::{AttributeValue, MetadataAttributes, RasterError, RasterResult};
use gdal::{Dataset, Metadata};
use std::path::{Path, PathBuf};

/// One science dataset inside an HDF container, as GDAL exposes it
#[derive(Debug, Clone, PartialEq)]
pub struct Subdataset {
    /// Short dataset name, e.g. `Fpar_500m`
    pub name: String,
    /// GDAL connection string used to open it
    pub gdal_name: String,
    pub description: Option<String>,
}

/// HDF4 / HDF-EOS granule reader (MODIS MCD15A2H and friends)
pub struct HdfGranule {
    path: PathBuf,
    global_attributes: MetadataAttributes,
    subdatasets: Vec<Subdataset>,
}

impl HdfGranule {
    /// Open a granule and index its global metadata and subdatasets
    pub fn open<P: AsRef<Path>>(path: P) -> RasterResult<Self> {
        let path = path.as_ref();
        log::info!("Opening HDF granule: {}", path.display());

        let dataset = Dataset::open(path).map_err(|e| RasterError::unreadable(path, e))?;
        let global_attributes = parse_attributes(dataset.metadata_domain("").unwrap_or_default());
        let subdatasets = parse_subdatasets(dataset.metadata_domain("SUBDATASETS").unwrap_or_default());

        if subdatasets.is_empty() {
            return Err(RasterError::unreadable(path, "granule contains no subdatasets"));
        }

        log::info!(
            "Got datasets {:?}",
            subdatasets.iter().map(|s| s.name.as_str()).collect::<Vec<_>>()
        );

        Ok(Self {
            path: path.to_path_buf(),
            global_attributes,
            subdatasets,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn subdatasets(&self) -> &[Subdataset] {
        &self.subdatasets
    }

    pub fn global_attributes(&self) -> &MetadataAttributes {
        &self.global_attributes
    }

    /// Look up a subdataset by its short name
    pub fn subdataset(&self, name: &str) -> RasterResult<&Subdataset> {
        self.subdatasets.iter().find(|s| s.name == name).ok_or_else(|| {
            let available = self.subdatasets.iter().map(|s| s.name.clone()).collect::<Vec<_>>();
            log::error!("Required dataset '{}' not found in {}", name, self.path.display());
            RasterError::MissingDataset {
                required: name.to_string(),
                available,
            }
        })
    }

    /// Open the named subdataset. Its attributes (fill value, scale, offset)
    /// are returned merged with the granule's global attributes; dataset-level
    /// values win.
    pub fn open_subdataset(&self, name: &str) -> RasterResult<(RasterHandle, MetadataAttributes)> {
        let subdataset = self.subdataset(name)?;
        let dataset = Dataset::open(Path::new(&subdataset.gdal_name))
            .map_err(|e| RasterError::unreadable(&self.path, e))?;
        let mut attributes = parse_attributes(dataset.metadata_domain("").unwrap_or_default());
        drop(dataset);

        attributes.merge_missing(&self.global_attributes);
        let handle = RasterHandle::open(Path::new(&subdataset.gdal_name))?;
        Ok((handle, attributes))
    }
}

/// Turn GDAL `KEY=VALUE` metadata entries into attributes
pub fn parse_attributes(entries: Vec<String>) -> MetadataAttributes {
    entries
        .into_iter()
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            let value = match value.trim().parse::<f64>() {
                Ok(number) => AttributeValue::Number(number),
                Err(_) => AttributeValue::Text(value.to_string()),
            };
            Some((key.trim().to_string(), value))
        })
        .collect()
}

/// Collect `SUBDATASET_n_NAME` / `SUBDATASET_n_DESC` pairs in index order
pub fn parse_subdatasets(entries: Vec<String>) -> Vec<Subdataset> {
    let mut indexed: Vec<(usize, Subdataset)> = Vec::new();
    let mut descriptions: Vec<(usize, String)> = Vec::new();

    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        let Some(rest) = key.strip_prefix("SUBDATASET_") else {
            continue;
        };
        let Some((index, kind)) = rest.split_once('_') else {
            continue;
        };
        let Ok(index) = index.parse::<usize>() else {
            continue;
        };

        match kind {
            "NAME" => {
                // HDF4_EOS:EOS_GRID:"file.hdf":MOD_Grid_MOD15A2H:Fpar_500m
                let name = value.rsplit(':').next().unwrap_or(value).trim_matches('"').to_string();
                indexed.push((
                    index,
                    Subdataset {
                        name,
                        gdal_name: value.to_string(),
                        description: None,
                    },
                ));
            }
            "DESC" => descriptions.push((index, value.to_string())),
            _ => {}
        }
    }

    for (index, description) in descriptions {
        if let Some((_, subdataset)) = indexed.iter_mut().find(|(i, _)| *i == index) {
            subdataset.description = Some(description);
        }
    }

    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, subdataset)| subdataset).collect()
}
