use crate::config::PipelineConfig;
use crate::pipeline::collaborators::{Acquisition, Publication, SourceDescriptor};
use crate::pipeline::sequencer::Sequencer;
use crate::pipeline::stages::{AcquireStage, ConvertHdfStage, MosaicStage, PublishStage, RescaleStage};
use crate::types::RasterResult;
use std::sync::Arc;

/// Sequencer for the FAPAR chain: acquire HDF granules, convert them to
/// GeoTIFF, rescale, publish
pub fn fapar(
    config: &PipelineConfig,
    acquisition: Arc<dyn Acquisition>,
    publication: Arc<dyn Publication>,
    source: SourceDescriptor,
) -> RasterResult<Sequencer> {
    config.validate()?;
    let mut sequencer = Sequencer::new(config);
    sequencer
        .add_stage(AcquireStage::new(acquisition, source))
        .add_stage(ConvertHdfStage::new(config.convert.clone()))
        .add_stage(RescaleStage::new(config.rescale.clone())?)
        .add_stage(PublishStage::new(publication, &config.fapar_namespace));
    Ok(sequencer)
}

/// Sequencer for the MOSDAC chain: acquire GeoTIFF tiles, rescale each,
/// compose the mosaic, publish it
pub fn mosdac(
    config: &PipelineConfig,
    acquisition: Arc<dyn Acquisition>,
    publication: Arc<dyn Publication>,
    source: SourceDescriptor,
) -> RasterResult<Sequencer> {
    config.validate()?;
    let mut sequencer = Sequencer::new(config);
    sequencer
        .add_stage(AcquireStage::new(acquisition, source))
        .add_stage(RescaleStage::new(config.rescale.clone())?)
        .add_stage(MosaicStage::new(config.mosaic.clone()))
        .add_stage(PublishStage::new(publication, &config.publish_namespace));
    Ok(sequencer)
}
