//! Reference atlas: the serialized bundle and its loaded, validated,
//! read-only form with neighbour indexes.

use crate::common::*;
use matrix_util::common_io::{open_buf_reader, open_buf_writer};
use matrix_util::knn_match::{ColumnDict, SearchMode};
use matrix_util::traits::MatOps;

use fnv::FnvHashMap as HashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::OnceLock;

/// ridge added to every cluster covariance
const COVARIANCE_RIDGE: f32 = 1e-3;

/// A dense matrix in column-major order
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DenseBlock {
    pub nrows: usize,
    pub ncols: usize,
    pub data: Vec<f32>,
}

impl DenseBlock {
    pub fn from_mat(xx: &Mat) -> Self {
        DenseBlock {
            nrows: xx.nrows(),
            ncols: xx.ncols(),
            data: xx.as_slice().to_vec(),
        }
    }

    pub fn to_mat(&self) -> anyhow::Result<Mat> {
        if self.data.len() != self.nrows * self.ncols {
            return Err(anyhow::anyhow!(
                "dense block of {} x {} holds {} values",
                self.nrows,
                self.ncols,
                self.data.len()
            ));
        }
        Ok(Mat::from_column_slice(self.nrows, self.ncols, &self.data))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReferenceCell {
    pub id: Box<str>,
    /// harmonized embedding
    pub embedding: Vec<f32>,
    pub umap: [f32; 2],
    /// fine cell-type label
    pub cell_type: Box<str>,
    pub pseudotime: f32,
    pub cycle_phase: Box<str>,
}

/// The on-disk atlas (`.json` or `.json.gz`)
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AtlasBundle {
    pub name: Box<str>,
    /// log-normalization: `ln(1 + scale_factor * count / total)`
    pub scale_factor: f32,
    /// ridge penalty on batch coefficients
    pub lambda: f32,
    pub genes: Vec<Box<str>>,
    pub gene_means: Vec<f32>,
    pub gene_sds: Vec<f32>,
    /// genes x d
    pub loadings: DenseBlock,
    /// d x K cluster centroids
    pub centroids: DenseBlock,
    /// K soft-clustering bandwidths
    pub cluster_sigma: Vec<f32>,
    /// K reference soft-cluster sizes `Nr_k = sum_i R_ki`
    pub cluster_size: Vec<f32>,
    /// d x K reference cluster moments `C_k = sum_i R_ki z_i`
    pub cluster_moments: DenseBlock,
    /// fine -> broad cell type
    pub broad_labels: BTreeMap<Box<str>, Box<str>>,
    pub cells: Vec<ReferenceCell>,
}

impl AtlasBundle {
    pub fn load(file: &str) -> anyhow::Result<Self> {
        info!("reading atlas bundle: {}", file);
        let reader = open_buf_reader(file)?;
        let bundle: AtlasBundle = serde_json::from_reader(reader)
            .map_err(|e| anyhow::anyhow!("failed to parse atlas {}: {}", file, e))?;
        Ok(bundle)
    }

    pub fn save(&self, file: &str) -> anyhow::Result<()> {
        let mut writer = open_buf_writer(file)?;
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        info!("wrote atlas bundle: {}", file);
        Ok(())
    }

    pub fn dim(&self) -> usize {
        self.loadings.ncols
    }

    pub fn num_clusters(&self) -> usize {
        self.centroids.ncols
    }

    /// Check every dimension and parameter before anything is built
    pub fn validate(&self) -> anyhow::Result<()> {
        let ngenes = self.genes.len();
        let dd = self.dim();
        let kk = self.num_clusters();

        if ngenes == 0 || dd == 0 || kk == 0 {
            return Err(anyhow::anyhow!(
                "atlas {} is empty: {} genes, {} dimensions, {} clusters",
                self.name,
                ngenes,
                dd,
                kk
            ));
        }

        if self.cells.is_empty() {
            return Err(anyhow::anyhow!("atlas {} has no reference cells", self.name));
        }

        if self.gene_means.len() != ngenes || self.gene_sds.len() != ngenes {
            return Err(anyhow::anyhow!("gene statistics do not match {} genes", ngenes));
        }

        if self.loadings.nrows != ngenes {
            return Err(anyhow::anyhow!(
                "loadings have {} rows for {} genes",
                self.loadings.nrows,
                ngenes
            ));
        }

        if self.centroids.nrows != dd || self.cluster_moments.nrows != dd {
            return Err(anyhow::anyhow!("cluster parameters do not have {} rows", dd));
        }

        if self.cluster_moments.ncols != kk
            || self.cluster_sigma.len() != kk
            || self.cluster_size.len() != kk
        {
            return Err(anyhow::anyhow!("cluster parameters disagree on {} clusters", kk));
        }

        if !(self.lambda > 0.0) || !(self.scale_factor > 0.0) {
            return Err(anyhow::anyhow!("lambda and scale factor must be positive"));
        }

        if let Some(k) = self.cluster_sigma.iter().position(|&s| !(s > 0.0)) {
            return Err(anyhow::anyhow!("cluster {} has non-positive sigma", k));
        }

        if let Some(k) = self.cluster_size.iter().position(|&n| !(n > 0.0)) {
            return Err(anyhow::anyhow!("cluster {} has no reference mass", k));
        }

        let finite = |xs: &[f32]| xs.iter().all(|x| x.is_finite());
        if !finite(&self.gene_means)
            || !finite(&self.gene_sds)
            || !finite(&self.loadings.data)
            || !finite(&self.centroids.data)
            || !finite(&self.cluster_moments.data)
        {
            return Err(anyhow::anyhow!("atlas {} has non-finite parameters", self.name));
        }

        let mut seen = HashMap::default();
        for (i, cell) in self.cells.iter().enumerate() {
            if cell.embedding.len() != dd {
                return Err(anyhow::anyhow!(
                    "reference cell {} has a {}-dimensional embedding, expected {}",
                    cell.id,
                    cell.embedding.len(),
                    dd
                ));
            }
            if !finite(&cell.embedding) || !finite(&cell.umap) || !cell.pseudotime.is_finite() {
                return Err(anyhow::anyhow!("reference cell {} has non-finite values", cell.id));
            }
            if seen.insert(cell.id.clone(), i).is_some() {
                return Err(anyhow::anyhow!("duplicate reference cell {}", cell.id));
            }
        }

        let mut gene_seen = HashMap::default();
        for g in self.genes.iter() {
            if gene_seen.insert(g.clone(), ()).is_some() {
                return Err(anyhow::anyhow!("duplicate atlas gene {}", g));
            }
        }

        Ok(())
    }
}

/// Weighted Gaussian summary of the reference cells in one cluster
pub struct ClusterGaussian {
    pub mean: DVec,
    pub precision: Mat,
}

/// The loaded atlas. Immutable once built; share it with `Arc`.
pub struct ReferenceAtlas {
    pub name: Box<str>,
    pub scale_factor: f32,
    pub lambda: f32,
    pub genes: Vec<Box<str>>,
    gene_index: HashMap<Box<str>, usize>,
    pub gene_means: DVec,
    pub gene_sds: DVec,
    /// genes x d
    pub loadings: Mat,
    /// d x K, unit columns
    pub centroids: Mat,
    pub cluster_sigma: DVec,
    pub cluster_size: DVec,
    /// d x K
    pub cluster_moments: Mat,
    /// d x N reference embedding
    pub embedding: Mat,
    /// 2 x N reference UMAP
    pub umap: Mat,
    pub cell_ids: Vec<Box<str>>,
    pub cell_types: Vec<Box<str>>,
    pub cycle_phases: Vec<Box<str>>,
    pub pseudotime: Vec<f32>,
    broad_labels: BTreeMap<Box<str>, Box<str>>,
    cell_type_levels: Vec<Box<str>>,
    embedding_index: ColumnDict,
    umap_index: ColumnDict,
    cluster_gaussians: OnceLock<Vec<ClusterGaussian>>,
}

impl ReferenceAtlas {
    /// Load and validate an atlas bundle, then build the neighbour
    /// indexes once
    pub fn load(file: &str, search: SearchMode) -> anyhow::Result<Self> {
        Self::from_bundle(AtlasBundle::load(file)?, search)
    }

    pub fn from_bundle(bundle: AtlasBundle, search: SearchMode) -> anyhow::Result<Self> {
        bundle.validate()?;

        let nn = bundle.cells.len();
        let dd = bundle.dim();

        let mut centroids = bundle.centroids.to_mat()?;
        centroids.normalize_columns_inplace();

        let mut embedding = Mat::zeros(dd, nn);
        let mut umap = Mat::zeros(2, nn);
        for (j, cell) in bundle.cells.iter().enumerate() {
            embedding
                .column_mut(j)
                .copy_from_slice(&cell.embedding);
            umap.column_mut(j).copy_from_slice(&cell.umap);
        }

        let cell_ids = bundle.cells.iter().map(|c| c.id.clone()).collect::<Vec<_>>();
        let cell_types = bundle
            .cells
            .iter()
            .map(|c| c.cell_type.clone())
            .collect::<Vec<_>>();
        let cycle_phases = bundle
            .cells
            .iter()
            .map(|c| c.cycle_phase.clone())
            .collect::<Vec<_>>();
        let pseudotime = bundle.cells.iter().map(|c| c.pseudotime).collect::<Vec<_>>();

        let mut cell_type_levels = cell_types.clone();
        cell_type_levels.sort();
        cell_type_levels.dedup();

        for ct in cell_type_levels.iter() {
            if !bundle.broad_labels.contains_key(ct) {
                warn!("no broad label for {}; it will stand for itself", ct);
            }
        }

        let gene_index = bundle
            .genes
            .iter()
            .enumerate()
            .map(|(i, g)| (g.clone(), i))
            .collect();

        info!(
            "atlas {}: {} cells, {} genes, {} dimensions, {} clusters",
            bundle.name,
            nn,
            bundle.genes.len(),
            dd,
            bundle.num_clusters()
        );

        let embedding_index = ColumnDict::from_columns(&embedding, search);
        let umap_index = ColumnDict::from_columns(&umap, search);
        info!(
            "built {} reference neighbour indexes",
            if embedding_index.is_exact() { "exact" } else { "HNSW" }
        );

        Ok(ReferenceAtlas {
            name: bundle.name,
            scale_factor: bundle.scale_factor,
            lambda: bundle.lambda,
            gene_means: DVec::from_vec(bundle.gene_means),
            gene_sds: DVec::from_vec(bundle.gene_sds),
            loadings: bundle.loadings.to_mat()?,
            genes: bundle.genes,
            gene_index,
            centroids,
            cluster_sigma: DVec::from_vec(bundle.cluster_sigma),
            cluster_size: DVec::from_vec(bundle.cluster_size),
            cluster_moments: bundle.cluster_moments.to_mat()?,
            embedding,
            umap,
            cell_ids,
            cell_types,
            cycle_phases,
            pseudotime,
            broad_labels: bundle.broad_labels,
            cell_type_levels,
            embedding_index,
            umap_index,
            cluster_gaussians: OnceLock::new(),
        })
    }

    pub fn dim(&self) -> usize {
        self.loadings.ncols()
    }

    pub fn num_clusters(&self) -> usize {
        self.centroids.ncols()
    }

    pub fn num_cells(&self) -> usize {
        self.cell_ids.len()
    }

    pub fn num_genes(&self) -> usize {
        self.genes.len()
    }

    pub fn gene_position(&self, gene: &str) -> Option<usize> {
        self.gene_index.get(gene).copied()
    }

    /// sorted distinct fine cell types
    pub fn cell_type_levels(&self) -> &[Box<str>] {
        &self.cell_type_levels
    }

    /// broad label of a fine label; unmapped labels stand for themselves
    pub fn broad_label(&self, fine: &str) -> Box<str> {
        self.broad_labels
            .get(fine)
            .cloned()
            .unwrap_or_else(|| fine.into())
    }

    pub fn embedding_index(&self) -> &ColumnDict {
        &self.embedding_index
    }

    pub fn umap_index(&self) -> &ColumnDict {
        &self.umap_index
    }

    /// Soft assignment of the columns of `zz` (d x n) to the atlas
    /// clusters (K x n)
    pub fn soft_cluster(&self, zz: &Mat) -> Mat {
        soft_cluster_assignment(zz, &self.centroids, &self.cluster_sigma)
    }

    /// Per-cluster weighted mean and precision of the reference
    /// embedding; computed on first use
    pub fn cluster_gaussians(&self) -> &[ClusterGaussian] {
        self.cluster_gaussians.get_or_init(|| {
            info!("summarizing reference clusters");
            let rr = self.soft_cluster(&self.embedding);
            (0..self.num_clusters())
                .into_par_iter()
                .map(|k| {
                    let fallback = self.cluster_moments.column(k) / self.cluster_size[k];
                    weighted_gaussian(&self.embedding, rr.row(k).iter().copied(), fallback)
                })
                .collect()
        })
    }
}

/// `R[k,j] ∝ exp(-2 (1 - y_k' z_j / |z_j|) / sigma_k)`, normalized over k
///
/// * `zz` - d x n embedding
/// * `centroids` - d x K unit-norm centroids
/// * `sigma` - K bandwidths
pub fn soft_cluster_assignment(zz: &Mat, centroids: &Mat, sigma: &DVec) -> Mat {
    let zz_cos = zz.normalize_columns();
    let mut logits = centroids.transpose() * zz_cos;
    for (k, mut row) in logits.row_iter_mut().enumerate() {
        let s = sigma[k];
        row.apply(|x| *x = -2.0 * (1.0 - *x) / s);
    }
    logits.normalize_exp_logits_columns_inplace();
    logits
}

fn weighted_gaussian(
    zz: &Mat,
    weights: impl Iterator<Item = f32>,
    fallback_mean: DVec,
) -> ClusterGaussian {
    let dd = zz.nrows();
    let weights = weights.collect::<Vec<_>>();
    let total: f32 = weights.iter().sum();

    if !(total > 1e-8) {
        return ClusterGaussian {
            mean: fallback_mean,
            precision: Mat::identity(dd, dd),
        };
    }

    let mut mean = DVec::zeros(dd);
    for (j, &w) in weights.iter().enumerate() {
        mean.axpy(w, &zz.column(j), 1.0);
    }
    mean /= total;

    let mut centred = zz.clone();
    for (j, mut col) in centred.column_iter_mut().enumerate() {
        col -= &mean;
        col *= weights[j].sqrt();
    }

    let mut cov = (&centred * centred.transpose()) / total;
    for i in 0..dd {
        cov[(i, i)] += COVARIANCE_RIDGE;
    }

    let precision = cov
        .clone()
        .cholesky()
        .map(|c| c.inverse())
        .or_else(|| cov.try_inverse())
        .unwrap_or_else(|| Mat::identity(dd, dd));

    ClusterGaussian { mean, precision }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn soft_assignment_prefers_aligned_centroid() {
        let centroids = Mat::from_column_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let sigma = DVec::from_vec(vec![0.1, 0.1]);
        let zz = Mat::from_column_slice(2, 2, &[5.0, 0.1, 0.0, 3.0]);
        let rr = soft_cluster_assignment(&zz, &centroids, &sigma);

        assert_abs_diff_eq!(rr.column(0).sum(), 1.0, epsilon = 1e-5);
        assert!(rr[(0, 0)] > 0.99);
        assert!(rr[(1, 1)] > 0.99);
    }

    #[test]
    fn weighted_gaussian_recovers_mean() {
        let zz = Mat::from_column_slice(2, 4, &[0.0, 0.0, 2.0, 0.0, 0.0, 2.0, 2.0, 2.0]);
        let g = weighted_gaussian(&zz, vec![1.0; 4].into_iter(), DVec::zeros(2));
        assert_abs_diff_eq!(g.mean[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(g.mean[1], 1.0, epsilon = 1e-6);
        // variance 1 + ridge on each axis
        assert_abs_diff_eq!(g.precision[(0, 0)], 1.0 / (1.0 + COVARIANCE_RIDGE), epsilon = 1e-4);
    }

    #[test]
    fn dense_block_rejects_wrong_size() {
        let block = DenseBlock {
            nrows: 2,
            ncols: 2,
            data: vec![1.0; 3],
        };
        assert!(block.to_mat().is_err());
    }
}
