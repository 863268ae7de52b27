use crate::common::*;
use crate::harmonize::HarmonizeArgs;
use crate::label_transfer::{AnnotatedQuery, LabelTransferArgs};
use crate::mapper::ReferenceMapper;
use crate::mapping_error::{score_mapping_error, MappingErrorMetric, MappingQcArgs};
use crate::query_input::QueryData;

#[derive(Clone, Debug, Default)]
pub struct ProjectionArgs {
    pub harmonize: HarmonizeArgs,
    /// metadata column with the donor of each cell; the batch key if
    /// not given
    pub donor_key: Option<Box<str>>,
    pub qc: MappingQcArgs,
    pub label: LabelTransferArgs,
}

/// harmonize -> score -> project -> classify
pub struct ProjectionPipeline {
    mapper: Arc<dyn ReferenceMapper>,
    metric: Arc<dyn MappingErrorMetric>,
}

impl ProjectionPipeline {
    pub fn new(mapper: Arc<dyn ReferenceMapper>, metric: Arc<dyn MappingErrorMetric>) -> Self {
        ProjectionPipeline { mapper, metric }
    }

    pub fn run(&self, query: &QueryData, args: &ProjectionArgs) -> anyhow::Result<AnnotatedQuery> {
        if args.label.knn == 0 || args.label.umap_knn == 0 {
            return Err(anyhow::anyhow!("the number of neighbours must be positive"));
        }

        let donor_key = args
            .donor_key
            .as_deref()
            .or(args.harmonize.batch_key.as_deref());
        let donors = query.group_labels(donor_key)?;

        let harmonized = self.mapper.harmonize(query, &args.harmonize)?;

        let scored = score_mapping_error(
            self.mapper.atlas(),
            harmonized,
            donors,
            self.metric.as_ref(),
            &args.qc,
        )?;

        let umap = self.mapper.project(&scored.harmonized, args.label.umap_knn)?;

        let annotated = self.mapper.classify(scored, umap, &args.label)?;

        info!("annotated {} query cells", annotated.num_cells());
        Ok(annotated)
    }
}
