//! Query harmonization into the reference space: log-normalize,
//! scale with the reference gene statistics, project on the
//! reference loadings and remove query batch effects by a
//! mixture-of-experts regression anchored on the reference clusters.

use crate::atlas::ReferenceAtlas;
use crate::common::*;
use crate::query_input::QueryData;

use indicatif::ParallelProgressIterator;
use matrix_util::utils::{generate_minibatch_intervals, partition_by_membership};
use rayon::prelude::*;

/// level name shared by batches too small to be corrected on their own
pub const POOLED_BATCH: &str = "pooled";

#[derive(Clone, Debug)]
pub struct HarmonizeArgs {
    /// metadata column with the batch of each cell
    pub batch_key: Option<Box<str>>,
    /// smaller batches are pooled into one level
    pub min_cells_per_batch: usize,
    /// cells per parallel job
    pub block_size: usize,
}

impl Default for HarmonizeArgs {
    fn default() -> Self {
        HarmonizeArgs {
            batch_key: None,
            min_cells_per_batch: DEFAULT_MIN_CELLS_PER_GROUP,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Query cells in the reference coordinate space
pub struct HarmonizedQuery {
    pub cells: Vec<Box<str>>,
    /// batch label of each cell as given
    pub batch: Vec<Box<str>>,
    /// d x n corrected embedding
    pub embedding: Mat,
    /// K x n soft assignment of the corrected embedding
    pub soft_clusters: Mat,
}

impl HarmonizedQuery {
    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }
}

/// Batch design after pooling small batches
#[derive(Clone, Debug, PartialEq)]
pub struct EffectiveBatches {
    pub levels: Vec<Box<str>>,
    /// level index of each cell
    pub membership: Vec<usize>,
}

impl EffectiveBatches {
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }
}

/// Give each batch with at least `min_cells` cells its own level and
/// merge the rest into one pooled level
pub fn effective_batches(labels: &[Box<str>], min_cells: usize) -> EffectiveBatches {
    let groups = partition_by_membership(labels);
    let mut names = groups.keys().cloned().collect::<Vec<_>>();
    names.sort();

    let mut levels: Vec<Box<str>> = vec![];
    let mut membership = vec![0; labels.len()];
    let mut pooled: Vec<usize> = vec![];

    for name in names {
        let cells = &groups[&name];
        if cells.len() < min_cells {
            warn!(
                "batch {} has {} cells (< {}); pooled with other small batches",
                name,
                cells.len(),
                min_cells
            );
            pooled.extend(cells.iter().copied());
        } else {
            for &j in cells {
                membership[j] = levels.len();
            }
            levels.push(name);
        }
    }

    if !pooled.is_empty() {
        for &j in pooled.iter() {
            membership[j] = levels.len();
        }
        levels.push(POOLED_BATCH.into());
    }

    EffectiveBatches { levels, membership }
}

/// Log-normalize, scale and project every query cell on the reference
/// loadings (d x n). Atlas genes missing in the query have zero
/// expression.
pub fn normalize_and_project(
    query: &QueryData,
    atlas: &ReferenceAtlas,
    block_size: usize,
) -> anyhow::Result<Mat> {
    let query_to_atlas = query
        .genes
        .iter()
        .map(|g| atlas.gene_position(g))
        .collect::<Vec<_>>();

    let nshared = query_to_atlas.iter().filter(|x| x.is_some()).count();
    if nshared == 0 {
        return Err(anyhow::anyhow!(
            "no gene is shared between the query and atlas {}",
            atlas.name
        ));
    }
    info!(
        "{} of {} atlas genes found in the query; {} treated as zero",
        nshared,
        atlas.num_genes(),
        atlas.num_genes() - nshared
    );

    // x = 0 after log-normalization scales to -mean/sd
    let inv_sd = atlas
        .gene_sds
        .map(|s| if s > 0.0 { 1.0 / s } else { 0.0 });
    let zero_scaled = -atlas.gene_means.component_mul(&inv_sd);
    let loadings_t = atlas.loadings.transpose();
    let base = &loadings_t * zero_scaled;

    let dd = atlas.dim();
    let nn = query.num_cells();
    let sf = atlas.scale_factor;
    let jobs = generate_minibatch_intervals(nn, block_size);

    let blocks = jobs
        .par_iter()
        .progress_count(jobs.len() as u64)
        .map(|&(lb, ub)| {
            let mut zz = Mat::zeros(dd, ub - lb);
            let mut nempty = 0;
            for j in lb..ub {
                let mut z = zz.column_mut(j - lb);
                z.copy_from(&base);

                let col = query.counts.col(j);
                let total: f32 = col.values().iter().sum();
                if total <= 0.0 {
                    nempty += 1;
                    continue;
                }

                for (&g, &y) in col.row_indices().iter().zip(col.values().iter()) {
                    if let Some(a) = query_to_atlas[g] {
                        if inv_sd[a] > 0.0 && y > 0.0 {
                            let x = (1.0 + sf * y / total).ln() * inv_sd[a];
                            z.axpy(x, &loadings_t.column(a), 1.0);
                        }
                    }
                }
            }
            (lb, zz, nempty)
        })
        .collect::<Vec<_>>();

    let mut ret = Mat::zeros(dd, nn);
    let mut nempty = 0;
    for (lb, zz, ne) in blocks {
        ret.columns_mut(lb, zz.ncols()).copy_from(&zz);
        nempty += ne;
    }

    if nempty > 0 {
        warn!("{} query cells have no counts", nempty);
    }

    Ok(ret)
}

/// Mixture-of-experts batch correction anchored on the reference.
///
/// For each cluster `k` with query weights `R[k,]`, solve the ridge
/// regression of the embedding on an intercept and the batch
/// indicators, where the intercept also carries the reference
/// cluster mass `Nr_k` and moment `C_k`. The batch terms are then
/// removed in proportion to `R[k,j]`. Every cluster is fit against
/// the uncorrected embedding.
///
/// * `zz` - d x n embedding
/// * `rr` - K x n soft cluster assignment of `zz`
/// * `batches` - design levels
pub fn moe_correct(
    zz: &Mat,
    rr: &Mat,
    batches: &EffectiveBatches,
    atlas: &ReferenceAtlas,
) -> anyhow::Result<Mat> {
    let kk = rr.nrows();
    let nb = batches.num_levels();
    let dd = zz.nrows();
    let lambda = atlas.lambda;

    let betas = (0..kk)
        .into_par_iter()
        .map(|k| -> anyhow::Result<Mat> {
            let mut aa = Mat::zeros(nb + 1, nb + 1);
            let mut bb = Mat::zeros(nb + 1, dd);

            for (j, z) in zz.column_iter().enumerate() {
                let r = rr[(k, j)];
                let b = batches.membership[j] + 1;
                aa[(0, 0)] += r;
                aa[(0, b)] += r;
                aa[(b, 0)] += r;
                aa[(b, b)] += r;

                let rz = z.transpose() * r;
                let mut row = bb.row_mut(0);
                row += &rz;
                let mut row = bb.row_mut(b);
                row += &rz;
            }

            aa[(0, 0)] += atlas.cluster_size[k];
            for b in 1..=nb {
                aa[(b, b)] += lambda;
            }
            let mut row = bb.row_mut(0);
            row += atlas.cluster_moments.column(k).transpose();

            let mut beta = aa
                .lu()
                .solve(&bb)
                .ok_or_else(|| anyhow::anyhow!("singular batch design in cluster {}", k))?;
            beta.row_mut(0).fill(0.0);
            Ok(beta)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let columns = (0..zz.ncols())
        .into_par_iter()
        .map(|j| {
            let b = batches.membership[j] + 1;
            let mut z = zz.column(j).clone_owned();
            for (k, beta) in betas.iter().enumerate() {
                z.axpy(-rr[(k, j)], &beta.row(b).transpose(), 1.0);
            }
            z
        })
        .collect::<Vec<_>>();

    let mut ret = zz.clone();
    for (j, z) in columns.iter().enumerate() {
        ret.set_column(j, z);
    }
    Ok(ret)
}

/// Map raw query counts into the reference embedding with batch
/// correction
pub fn harmonize_query(
    query: &QueryData,
    atlas: &ReferenceAtlas,
    args: &HarmonizeArgs,
) -> anyhow::Result<HarmonizedQuery> {
    let batch = query.group_labels(args.batch_key.as_deref())?;

    info!("projecting {} query cells", query.num_cells());
    let z0 = normalize_and_project(query, atlas, args.block_size)?;
    let r0 = atlas.soft_cluster(&z0);

    let batches = effective_batches(&batch, args.min_cells_per_batch);
    info!(
        "correcting {} batch level(s) over {} clusters",
        batches.num_levels(),
        atlas.num_clusters()
    );

    let embedding = moe_correct(&z0, &r0, &batches, atlas)?;
    let soft_clusters = atlas.soft_cluster(&embedding);

    Ok(HarmonizedQuery {
        cells: query.cells.clone(),
        batch,
        embedding,
        soft_clusters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_batches_are_pooled() {
        let mut labels: Vec<Box<str>> = vec![];
        labels.extend((0..12).map(|_| "big".into()));
        labels.extend((0..3).map(|_| "s1".into()));
        labels.extend((0..2).map(|_| "s2".into()));

        let eb = effective_batches(&labels, 10);
        let expected: Vec<Box<str>> = vec!["big".into(), POOLED_BATCH.into()];
        assert_eq!(eb.levels, expected);
        assert!(eb.membership[..12].iter().all(|&b| b == 0));
        assert!(eb.membership[12..].iter().all(|&b| b == 1));
    }

    #[test]
    fn one_batch_without_key() {
        let labels: Vec<Box<str>> = vec![GLOBAL_GROUP.into(); 20];
        let eb = effective_batches(&labels, 10);
        assert_eq!(eb.num_levels(), 1);
        assert!(eb.membership.iter().all(|&b| b == 0));
    }
}
