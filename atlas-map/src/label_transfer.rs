//! KNN label and pseudotime transfer from the reference atlas.

use crate::atlas::ReferenceAtlas;
use crate::common::*;
use crate::mapping_error::ScoredQuery;

use fnv::FnvHashMap as HashMap;
use rayon::prelude::*;

/// neighbours closer than this are treated as coincident
pub const COINCIDENT_DISTANCE: f32 = 1e-6;

#[derive(Clone, Debug)]
pub struct LabelTransferArgs {
    /// neighbours for the votes and pseudotime
    pub knn: usize,
    /// neighbours for the UMAP projection
    pub umap_knn: usize,
}

impl Default for LabelTransferArgs {
    fn default() -> Self {
        LabelTransferArgs {
            knn: DEFAULT_KNN,
            umap_knn: DEFAULT_UMAP_KNN,
        }
    }
}

/// Plurality vote over neighbour labels given nearest first.
///
/// Among labels tied for the most votes, the one carried by the
/// nearest neighbour wins. Returns the label and its vote share.
pub fn majority_vote<'a, I>(labels: I) -> Option<(&'a str, f32)>
where
    I: IntoIterator<Item = &'a str>,
{
    // label -> (votes, rank of first appearance)
    let mut votes: HashMap<&'a str, (usize, usize)> = HashMap::default();
    let mut ntot = 0;
    for (rank, label) in labels.into_iter().enumerate() {
        votes.entry(label).or_insert((0, rank)).0 += 1;
        ntot += 1;
    }

    votes
        .into_iter()
        .max_by(|a, b| (a.1 .0).cmp(&b.1 .0).then((b.1 .1).cmp(&a.1 .1)))
        .map(|(label, (n, _))| (label, n as f32 / ntot as f32))
}

/// Inverse-distance weighted mean `sum_i v_i / d_i / sum_i 1 / d_i`.
/// If any neighbour coincides with the query, the plain mean over the
/// coincident neighbours.
pub fn weighted_pseudotime(distances: &[f32], values: &[f32]) -> Option<f32> {
    if distances.is_empty() || distances.len() != values.len() {
        return None;
    }

    let coincident = distances
        .iter()
        .zip(values.iter())
        .filter(|&(&d, _)| d <= COINCIDENT_DISTANCE)
        .map(|(_, &v)| v)
        .collect::<Vec<_>>();

    if !coincident.is_empty() {
        return Some(coincident.iter().sum::<f32>() / coincident.len() as f32);
    }

    let (num, denom) = distances
        .iter()
        .zip(values.iter())
        .fold((0.0, 0.0), |(num, denom), (&d, &v)| (num + v / d, denom + 1.0 / d));

    Some(num / denom)
}

/// Initial annotation of one query cell
#[derive(Clone, Debug, PartialEq)]
pub struct CellAnnotation {
    pub cell_type: Box<str>,
    pub cell_type_prob: f32,
    pub cell_type_broad: Box<str>,
    pub cycle_phase: Box<str>,
    pub cycle_phase_prob: f32,
    pub pseudotime: f32,
}

/// Scored query with initial annotations and UMAP coordinates. Final
/// values are the initial ones masked by mapping QC.
pub struct AnnotatedQuery {
    pub scored: ScoredQuery,
    /// 2 x n
    pub umap: Mat,
    pub annotations: Vec<CellAnnotation>,
}

impl AnnotatedQuery {
    pub fn num_cells(&self) -> usize {
        self.annotations.len()
    }

    pub fn cells(&self) -> &[Box<str>] {
        self.scored.cells()
    }

    pub fn is_pass(&self, j: usize) -> bool {
        self.scored.qc_status(j).is_pass()
    }

    pub fn final_cell_type(&self, j: usize) -> Option<&str> {
        self.is_pass(j).then(|| self.annotations[j].cell_type.as_ref())
    }

    pub fn final_cell_type_broad(&self, j: usize) -> Option<&str> {
        self.is_pass(j)
            .then(|| self.annotations[j].cell_type_broad.as_ref())
    }

    pub fn final_cycle_phase(&self, j: usize) -> Option<&str> {
        self.is_pass(j).then(|| self.annotations[j].cycle_phase.as_ref())
    }

    pub fn final_pseudotime(&self, j: usize) -> Option<f32> {
        self.is_pass(j).then(|| self.annotations[j].pseudotime)
    }
}

/// Vote cell type and cycle phase over the `knn` nearest reference
/// cells in the harmonized space, and average pseudotime over the
/// `knn` nearest reference cells in the UMAP space.
///
/// * `umap` - 2 x n query coordinates in the reference UMAP
pub fn transfer_labels(
    atlas: &ReferenceAtlas,
    scored: ScoredQuery,
    umap: Mat,
    args: &LabelTransferArgs,
) -> anyhow::Result<AnnotatedQuery> {
    if args.knn == 0 {
        return Err(anyhow::anyhow!("the number of neighbours must be positive"));
    }

    let nn = scored.num_cells();
    if umap.ncols() != nn || umap.nrows() != 2 {
        return Err(anyhow::anyhow!(
            "UMAP coordinates are {} x {} for {} cells",
            umap.nrows(),
            umap.ncols(),
            nn
        ));
    }

    let knn = args.knn.min(atlas.num_cells());
    info!("transferring labels from {} reference neighbours", knn);

    let embedding_nn = atlas
        .embedding_index()
        .search_columns(&scored.harmonized.embedding, knn)?;
    let umap_nn = atlas.umap_index().search_columns(&umap, knn)?;

    let annotations = embedding_nn
        .par_iter()
        .zip(umap_nn.par_iter())
        .enumerate()
        .map(|(j, (enn, unn))| -> anyhow::Result<CellAnnotation> {
            let cell = &scored.cells()[j];

            let (cell_type, cell_type_prob) =
                majority_vote(enn.indices.iter().map(|&i| atlas.cell_types[i].as_ref()))
                    .ok_or_else(|| anyhow::anyhow!("no neighbours for cell {}", cell))?;

            let (cycle_phase, cycle_phase_prob) =
                majority_vote(enn.indices.iter().map(|&i| atlas.cycle_phases[i].as_ref()))
                    .ok_or_else(|| anyhow::anyhow!("no neighbours for cell {}", cell))?;

            let times = unn
                .indices
                .iter()
                .map(|&i| atlas.pseudotime[i])
                .collect::<Vec<_>>();
            let pseudotime = weighted_pseudotime(&unn.distances, &times)
                .ok_or_else(|| anyhow::anyhow!("no UMAP neighbours for cell {}", cell))?;

            Ok(CellAnnotation {
                cell_type: cell_type.into(),
                cell_type_prob,
                cell_type_broad: atlas.broad_label(cell_type),
                cycle_phase: cycle_phase.into(),
                cycle_phase_prob,
                pseudotime,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(AnnotatedQuery {
        scored,
        umap,
        annotations,
    })
}
