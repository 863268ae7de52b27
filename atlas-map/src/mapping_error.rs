//! Mapping-error scores and MAD-based outlier QC.

use crate::atlas::ReferenceAtlas;
use crate::common::*;
use crate::harmonize::HarmonizedQuery;

use indicatif::ParallelProgressIterator;
use matrix_util::robust_stat::median_mad;
use matrix_util::utils::partition_by_membership;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// soft assignments below this weight do not contribute to a score
const MIN_CLUSTER_WEIGHT: f32 = 1e-6;

/// A per-cell score of how poorly a query cell fits the reference;
/// larger is worse
pub trait MappingErrorMetric: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, atlas: &ReferenceAtlas, query: &HarmonizedQuery) -> anyhow::Result<Vec<f32>>;
}

/// `sum_k R[k,j] * sqrt((z_j - mu_k)' Sigma_k^-1 (z_j - mu_k))` over
/// the reference cluster Gaussians
pub struct MixtureMahalanobis;

impl MappingErrorMetric for MixtureMahalanobis {
    fn name(&self) -> &'static str {
        "mixture-mahalanobis"
    }

    fn score(&self, atlas: &ReferenceAtlas, query: &HarmonizedQuery) -> anyhow::Result<Vec<f32>> {
        let gaussians = atlas.cluster_gaussians();
        let zz = &query.embedding;
        let rr = &query.soft_clusters;
        let nn = zz.ncols();

        Ok((0..nn)
            .into_par_iter()
            .progress_count(nn as u64)
            .map(|j| {
                let z = zz.column(j);
                gaussians
                    .iter()
                    .enumerate()
                    .filter(|&(k, _)| rr[(k, j)] > MIN_CLUSTER_WEIGHT)
                    .map(|(k, g)| {
                        let delta = z - &g.mean;
                        let m2 = (delta.transpose() * &g.precision * &delta)[(0, 0)];
                        rr[(k, j)] * m2.max(0.0).sqrt()
                    })
                    .sum::<f32>()
            })
            .collect())
    }
}

/// Mean Euclidean distance to the `knn` nearest reference cells
pub struct NeighbourDistance {
    pub knn: usize,
}

impl MappingErrorMetric for NeighbourDistance {
    fn name(&self) -> &'static str {
        "neighbour-distance"
    }

    fn score(&self, atlas: &ReferenceAtlas, query: &HarmonizedQuery) -> anyhow::Result<Vec<f32>> {
        let neighbours = atlas
            .embedding_index()
            .search_columns(&query.embedding, self.knn)?;
        Ok(neighbours
            .iter()
            .map(|n| n.distances.iter().sum::<f32>() / n.len().max(1) as f32)
            .collect())
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MetricKind {
    #[default]
    Mahalanobis,
    NeighbourDistance,
}

impl MetricKind {
    pub fn build(self, knn: usize) -> Arc<dyn MappingErrorMetric> {
        match self {
            MetricKind::Mahalanobis => Arc::new(MixtureMahalanobis),
            MetricKind::NeighbourDistance => Arc::new(NeighbourDistance { knn }),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MappingQcArgs {
    /// `k` in `median + k * MAD`
    pub mad_threshold: f32,
    /// one threshold per donor instead of one over all cells
    pub by_donor: bool,
    /// smaller donor groups use the global threshold
    pub min_cells_per_donor: usize,
    /// MAD multiplier (1.4826 for the normal-consistent estimator)
    pub mad_consistency: f32,
}

impl Default for MappingQcArgs {
    fn default() -> Self {
        MappingQcArgs {
            mad_threshold: DEFAULT_MAD_THRESHOLD,
            by_donor: false,
            min_cells_per_donor: DEFAULT_MIN_CELLS_PER_GROUP,
            mad_consistency: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MadThreshold {
    pub median: f32,
    pub mad: f32,
    pub threshold: f32,
    /// this group borrowed the global threshold
    pub fallback: bool,
}

impl MadThreshold {
    pub fn estimate(scores: &[f32], k: f32, consistency: f32) -> Option<Self> {
        let (median, mad) = median_mad(scores, consistency)?;
        Some(MadThreshold {
            median,
            mad,
            threshold: median + k * mad,
            fallback: false,
        })
    }

    /// Pass at or below the threshold
    pub fn classify(&self, score: f32) -> QcStatus {
        if score > self.threshold {
            QcStatus::Fail
        } else {
            QcStatus::Pass
        }
    }
}

/// QC outcome of every cell and the threshold used per group
pub struct MappingQc {
    pub status: Vec<QcStatus>,
    pub global: MadThreshold,
    pub per_donor: BTreeMap<Box<str>, MadThreshold>,
}

/// `Fail` iff `score > median + k * MAD`, globally or within each
/// donor
pub fn classify_mapping_qc(
    scores: &[f32],
    donors: &[Box<str>],
    args: &MappingQcArgs,
) -> anyhow::Result<MappingQc> {
    if scores.len() != donors.len() {
        return Err(anyhow::anyhow!(
            "{} scores but {} donor labels",
            scores.len(),
            donors.len()
        ));
    }

    if !(args.mad_threshold >= 0.0) || !(args.mad_consistency > 0.0) {
        return Err(anyhow::anyhow!(
            "MAD threshold must be non-negative and consistency positive"
        ));
    }

    let k = args.mad_threshold;
    let global = MadThreshold::estimate(scores, k, args.mad_consistency)
        .ok_or_else(|| anyhow::anyhow!("no finite mapping-error scores"))?;

    info!(
        "global mapping-error threshold: median {:.4} + {} x MAD {:.4} = {:.4}",
        global.median, k, global.mad, global.threshold
    );

    let mut status = scores.iter().map(|&s| global.classify(s)).collect::<Vec<_>>();
    let mut per_donor = BTreeMap::new();

    if args.by_donor {
        let fallback = MadThreshold {
            fallback: true,
            ..global
        };

        for (donor, cells) in partition_by_membership(donors) {
            let donor_scores = cells.iter().map(|&j| scores[j]).collect::<Vec<_>>();

            let thr = if cells.len() < args.min_cells_per_donor {
                warn!(
                    "donor {} has {} cells (< {}); using the global threshold",
                    donor,
                    cells.len(),
                    args.min_cells_per_donor
                );
                fallback
            } else {
                match MadThreshold::estimate(&donor_scores, k, args.mad_consistency) {
                    Some(t) if t.mad > 0.0 => t,
                    _ => {
                        warn!("donor {} has zero MAD; using the global threshold", donor);
                        fallback
                    }
                }
            };

            for (&j, &s) in cells.iter().zip(donor_scores.iter()) {
                status[j] = thr.classify(s);
            }
            per_donor.insert(donor, thr);
        }
    }

    let nfail = status.iter().filter(|s| !s.is_pass()).count();
    info!("mapping QC: {} of {} cells fail", nfail, status.len());

    Ok(MappingQc {
        status,
        global,
        per_donor,
    })
}

/// Harmonized query with mapping-error scores and QC
pub struct ScoredQuery {
    pub harmonized: HarmonizedQuery,
    pub donors: Vec<Box<str>>,
    pub mapping_error: Vec<f32>,
    pub qc: MappingQc,
}

impl ScoredQuery {
    pub fn num_cells(&self) -> usize {
        self.harmonized.num_cells()
    }

    pub fn cells(&self) -> &[Box<str>] {
        &self.harmonized.cells
    }

    pub fn qc_status(&self, j: usize) -> QcStatus {
        self.qc.status[j]
    }
}

/// Score every cell and classify it. A non-finite score is an error
/// naming the cell.
pub fn score_mapping_error(
    atlas: &ReferenceAtlas,
    harmonized: HarmonizedQuery,
    donors: Vec<Box<str>>,
    metric: &dyn MappingErrorMetric,
    args: &MappingQcArgs,
) -> anyhow::Result<ScoredQuery> {
    if donors.len() != harmonized.num_cells() {
        return Err(anyhow::anyhow!(
            "{} donor labels for {} cells",
            donors.len(),
            harmonized.num_cells()
        ));
    }

    info!("scoring mapping error: {}", metric.name());
    let mapping_error = metric.score(atlas, &harmonized)?;

    if let Some(j) = mapping_error.iter().position(|s| !s.is_finite()) {
        return Err(anyhow::anyhow!(
            "non-finite mapping error ({}) for cell {}",
            mapping_error[j],
            harmonized.cells[j]
        ));
    }

    let qc = classify_mapping_qc(&mapping_error, &donors, args)?;

    Ok(ScoredQuery {
        harmonized,
        donors,
        mapping_error,
        qc,
    })
}
