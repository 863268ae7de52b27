use crate::atlas::ReferenceAtlas;
use crate::common::*;
use crate::harmonize::{harmonize_query, HarmonizeArgs, HarmonizedQuery};
use crate::label_transfer::{transfer_labels, AnnotatedQuery, LabelTransferArgs};
use crate::mapping_error::ScoredQuery;
use crate::query_input::QueryData;
use crate::umap_transform::project_to_reference_umap;

/// Map query cells onto a reference: place them in the reference
/// space, in the reference UMAP, and label them from their
/// reference neighbours
pub trait ReferenceMapper: Send + Sync {
    fn atlas(&self) -> &ReferenceAtlas;

    fn harmonize(&self, query: &QueryData, args: &HarmonizeArgs)
        -> anyhow::Result<HarmonizedQuery>;

    /// 2 x n coordinates in the reference UMAP
    fn project(&self, harmonized: &HarmonizedQuery, umap_knn: usize) -> anyhow::Result<Mat>;

    fn classify(
        &self,
        scored: ScoredQuery,
        umap: Mat,
        args: &LabelTransferArgs,
    ) -> anyhow::Result<AnnotatedQuery>;
}

/// Reference-anchored harmonization with KNN label transfer
pub struct SymphonyMapper {
    atlas: Arc<ReferenceAtlas>,
}

impl SymphonyMapper {
    pub fn new(atlas: Arc<ReferenceAtlas>) -> Self {
        SymphonyMapper { atlas }
    }
}

impl ReferenceMapper for SymphonyMapper {
    fn atlas(&self) -> &ReferenceAtlas {
        &self.atlas
    }

    fn harmonize(
        &self,
        query: &QueryData,
        args: &HarmonizeArgs,
    ) -> anyhow::Result<HarmonizedQuery> {
        harmonize_query(query, &self.atlas, args)
    }

    fn project(&self, harmonized: &HarmonizedQuery, umap_knn: usize) -> anyhow::Result<Mat> {
        project_to_reference_umap(&self.atlas, &harmonized.embedding, &harmonized.cells, umap_knn)
    }

    fn classify(
        &self,
        scored: ScoredQuery,
        umap: Mat,
        args: &LabelTransferArgs,
    ) -> anyhow::Result<AnnotatedQuery> {
        transfer_labels(&self.atlas, scored, umap, args)
    }
}
