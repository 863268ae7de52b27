//! Synthetic reference atlas and query data.
//!
//! Cell types have their own Poisson expression profiles with marker
//! genes. The atlas parameters are derived directly from labelled
//! reference cells: loadings span the type means, centroids are the
//! type means in the embedding, and the UMAP places each type on a
//! circle. Query donors carry a multiplicative gene-wise batch effect.
//!
//! ```text
//! Y(g,j) ~ Poisson( depth * rho(g, T(j)) * delta(g, D(j)) )
//! ```

use crate::atlas::{soft_cluster_assignment, AtlasBundle, DenseBlock, ReferenceCell};
use crate::common::*;
use crate::query_input::{csc_from_triplets, CellMetadata, QueryData};

use indicatif::ParallelProgressIterator;
use matrix_util::traits::*;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Poisson};
use rayon::prelude::*;
use std::collections::BTreeMap;

const CELL_TYPES: [(&str, &str); 10] = [
    ("HSC", "HSPC"),
    ("MPP", "HSPC"),
    ("GMP", "Myeloid"),
    ("Monocyte", "Myeloid"),
    ("MEP", "Erythroid"),
    ("Erythroid", "Erythroid"),
    ("Pre-B", "Lymphoid"),
    ("B", "Lymphoid"),
    ("NK", "Lymphoid"),
    ("pDC", "Dendritic"),
];

const CYCLE_PHASES: [&str; 3] = ["G1", "S", "G2M"];

const SCALE_FACTOR: f32 = 1e4;
const LAMBDA: f32 = 1.0;
const CLUSTER_SIGMA: f32 = 0.1;
const UMAP_RADIUS: f32 = 10.0;
const MARKER_FOLD: f32 = 10.0;

#[derive(Clone, Debug)]
pub struct SimArgs {
    pub cell_types: usize,
    pub cells_per_type: usize,
    pub genes: usize,
    pub markers_per_type: usize,
    /// embedding dimension
    pub dim: usize,
    /// expected count per cell
    pub depth: usize,
    pub query_donors: usize,
    pub query_cells_per_donor: usize,
    /// standard deviation of the log gene-wise donor effect
    pub donor_effect: f32,
    /// standard deviation of reference pseudotime noise
    pub pseudotime_jitter: f32,
    pub rseed: u64,
}

impl Default for SimArgs {
    fn default() -> Self {
        SimArgs {
            cell_types: 4,
            cells_per_type: 100,
            genes: 200,
            markers_per_type: 10,
            dim: 10,
            depth: 2000,
            query_donors: 2,
            query_cells_per_donor: 100,
            donor_effect: 0.3,
            pseudotime_jitter: 0.0,
            rseed: 42,
        }
    }
}

pub struct SimOut {
    pub atlas: AtlasBundle,
    pub query: QueryData,
    /// true cell type of each query cell
    pub query_cell_types: Vec<Box<str>>,
}

fn cell_type_name(t: usize) -> (Box<str>, Box<str>) {
    match CELL_TYPES.get(t) {
        Some(&(fine, broad)) => (fine.into(), broad.into()),
        None => {
            let name: Box<str> = format!("Type{}", t).into();
            (name.clone(), name)
        }
    }
}

/// Sample one cell's counts as `(gene, count)` pairs
fn sample_counts(rates: &[f32], depth: f32, rng: &mut impl Rng) -> Vec<(usize, f32)> {
    let tot: f32 = rates.iter().sum();
    rates
        .iter()
        .enumerate()
        .filter_map(|(g, &r)| {
            let lambda = (depth * r / tot).max(1e-8);
            let y: f32 = Poisson::new(lambda).ok()?.sample(rng);
            (y > 0.5).then_some((g, y))
        })
        .collect()
}

fn sample_triplets(
    rates_per_cell: &[&[f32]],
    depth: f32,
    rseed: u64,
) -> Vec<(u64, u64, f32)> {
    let nn = rates_per_cell.len();
    rates_per_cell
        .par_iter()
        .enumerate()
        .progress_count(nn as u64)
        .map(|(j, rates)| {
            let mut rng = rand::rngs::StdRng::seed_from_u64(rseed + j as u64);
            sample_counts(rates, depth, &mut rng)
                .into_iter()
                .map(|(g, y)| (g as u64, j as u64, y))
                .collect::<Vec<_>>()
        })
        .flatten()
        .collect()
}

/// `ln(1 + sf * y / total)` of a genes x cells count matrix
fn log_normalize(counts: &CscMat, scale_factor: f32) -> Mat {
    let mut xx = Mat::zeros(counts.nrows(), counts.ncols());
    for j in 0..counts.ncols() {
        let col = counts.col(j);
        let tot: f32 = col.values().iter().sum();
        if tot > 0.0 {
            for (&g, &y) in col.row_indices().iter().zip(col.values().iter()) {
                xx[(g, j)] = (1.0 + scale_factor * y / tot).ln();
            }
        }
    }
    xx
}

/// Mean of the columns of each group (d x ngroups)
fn group_means(zz: &Mat, membership: &[usize], ngroups: usize) -> Mat {
    let mut ret = Mat::zeros(zz.nrows(), ngroups);
    let mut size = vec![0_f32; ngroups];
    for (j, &t) in membership.iter().enumerate() {
        let mut col = ret.column_mut(t);
        col += zz.column(j);
        size[t] += 1.0;
    }
    for (t, mut col) in ret.column_iter_mut().enumerate() {
        col /= size[t].max(1.0);
    }
    ret
}

/// Simulate a reference atlas and a query drawn from the same cell
/// types with donor effects
pub fn simulate_atlas_and_query(args: &SimArgs) -> anyhow::Result<SimOut> {
    let ntypes = args.cell_types;
    let ngenes = args.genes;
    let dd = args.dim;

    if ntypes == 0 || args.cells_per_type == 0 || ngenes == 0 {
        return Err(anyhow::anyhow!("need at least one cell type, cell and gene"));
    }
    if dd == 0 || dd > ngenes {
        return Err(anyhow::anyhow!(
            "embedding dimension {} must be in 1..={}",
            dd,
            ngenes
        ));
    }

    let mut rng = rand::rngs::StdRng::seed_from_u64(args.rseed);
    let rnorm = Normal::new(0.0_f32, 1.0)?;

    // 1. cell-type expression profiles
    let profiles = (0..ntypes)
        .map(|t| {
            (0..ngenes)
                .map(|g| {
                    let base = (0.5 * rnorm.sample(&mut rng)).exp();
                    let marker = (g / args.markers_per_type.max(1)) % ntypes == t
                        && g < args.markers_per_type * ntypes;
                    if marker {
                        base * MARKER_FOLD
                    } else {
                        base
                    }
                })
                .collect::<Vec<f32>>()
        })
        .collect::<Vec<_>>();

    // 2. reference cells
    let nref = ntypes * args.cells_per_type;
    let ref_types = (0..nref)
        .map(|j| j / args.cells_per_type)
        .collect::<Vec<_>>();
    let ref_rates = ref_types
        .iter()
        .map(|&t| profiles[t].as_slice())
        .collect::<Vec<_>>();

    let depth = args.depth as f32;
    let ref_triplets = sample_triplets(&ref_rates, depth, args.rseed);
    let ref_counts = csc_from_triplets(&ref_triplets, ngenes, nref)?;
    info!(
        "simulated {} reference cells with {} non-zero elements",
        nref,
        ref_triplets.len()
    );

    // 3. gene statistics and loadings spanning the type means
    let xx = log_normalize(&ref_counts, SCALE_FACTOR);
    let gene_means = xx.row_means();
    let gene_sds = xx.row_sds();

    let mut xx_scaled = xx;
    for (g, mut row) in xx_scaled.row_iter_mut().enumerate() {
        let (m, s) = (gene_means[g], gene_sds[g]);
        row.apply(|x| *x = if s > 0.0 { (*x - m) / s } else { 0.0 });
    }

    let type_means = group_means(&xx_scaled, &ref_types, ntypes);
    let mut basis = Mat::from_fn(ngenes, dd, |_, _| rnorm.sample(&mut rng));
    let nspan = ntypes.min(dd);
    basis
        .columns_mut(0, nspan)
        .copy_from(&type_means.columns(0, nspan));
    let loadings = basis.qr().q();

    let zz = loadings.transpose() * &xx_scaled;

    // 4. cluster mixture: one cluster per type
    let mut centroids = group_means(&zz, &ref_types, ntypes);
    centroids.normalize_columns_inplace();
    let sigma = DVec::from_element(ntypes, CLUSTER_SIGMA);
    let rr = soft_cluster_assignment(&zz, &centroids, &sigma);
    let cluster_size = rr.column_sum();
    let cluster_moments = &zz * rr.transpose();

    // 5. reference annotations
    let runif_phase = rand_distr::Uniform::new(0, CYCLE_PHASES.len())?;
    let mut broad_labels = BTreeMap::new();
    let cells = (0..nref)
        .map(|j| {
            let t = ref_types[j];
            let (fine, broad) = cell_type_name(t);
            broad_labels.insert(fine.clone(), broad);

            let angle = 2.0 * std::f32::consts::PI * t as f32 / ntypes as f32;
            let umap = [
                UMAP_RADIUS * angle.cos() + rnorm.sample(&mut rng),
                UMAP_RADIUS * angle.sin() + rnorm.sample(&mut rng),
            ];

            let t0 = if ntypes > 1 {
                t as f32 / (ntypes - 1) as f32
            } else {
                0.0
            };
            let pseudotime =
                (t0 + args.pseudotime_jitter * rnorm.sample(&mut rng)).clamp(0.0, 1.0);

            ReferenceCell {
                id: format!("ref{}", j).into(),
                embedding: zz.column(j).iter().copied().collect(),
                umap,
                cell_type: fine,
                pseudotime,
                cycle_phase: CYCLE_PHASES[runif_phase.sample(&mut rng)].into(),
            }
        })
        .collect::<Vec<_>>();

    let genes = (0..ngenes)
        .map(|g| format!("G{:05}", g).into_boxed_str())
        .collect::<Vec<_>>();

    let atlas = AtlasBundle {
        name: "simulated".into(),
        scale_factor: SCALE_FACTOR,
        lambda: LAMBDA,
        genes: genes.clone(),
        gene_means,
        gene_sds,
        loadings: DenseBlock::from_mat(&loadings),
        centroids: DenseBlock::from_mat(&centroids),
        cluster_sigma: sigma.iter().copied().collect(),
        cluster_size: cluster_size.iter().copied().collect(),
        cluster_moments: DenseBlock::from_mat(&cluster_moments),
        broad_labels,
        cells,
    };

    // 6. query donors with gene-wise effects
    let ndonors = args.query_donors.max(1);
    let nquery = ndonors * args.query_cells_per_donor;
    let donor_effect = Normal::new(0.0_f32, args.donor_effect.max(0.0))?;
    let donor_rates = (0..ndonors)
        .map(|_| {
            profiles
                .iter()
                .map(|rho| {
                    rho.iter()
                        .map(|&r| r * donor_effect.sample(&mut rng).exp())
                        .collect::<Vec<f32>>()
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let runif_type = rand_distr::Uniform::new(0, ntypes)?;
    let query_donor_index = (0..nquery)
        .map(|j| j / args.query_cells_per_donor.max(1))
        .collect::<Vec<_>>();
    let query_type_index = (0..nquery)
        .map(|_| runif_type.sample(&mut rng))
        .collect::<Vec<_>>();

    let query_rates = (0..nquery)
        .map(|j| donor_rates[query_donor_index[j]][query_type_index[j]].as_slice())
        .collect::<Vec<_>>();
    let query_triplets = sample_triplets(&query_rates, depth, args.rseed + nref as u64);
    let query_counts = csc_from_triplets(&query_triplets, ngenes, nquery)?;

    let query_cells = (0..nquery)
        .map(|j| format!("q{}", j).into_boxed_str())
        .collect::<Vec<_>>();
    let query_cell_types = query_type_index
        .iter()
        .map(|&t| cell_type_name(t).0)
        .collect::<Vec<_>>();
    let metadata = CellMetadata {
        columns: vec!["donor".into(), "cell_type".into()],
        rows: (0..nquery)
            .map(|j| {
                vec![
                    format!("donor{}", query_donor_index[j] + 1).into_boxed_str(),
                    query_cell_types[j].clone(),
                ]
            })
            .collect(),
    };

    info!(
        "simulated {} query cells from {} donors with {} non-zero elements",
        nquery,
        ndonors,
        query_triplets.len()
    );

    let query = QueryData::new(query_counts, genes, query_cells, metadata)?;

    Ok(SimOut {
        atlas,
        query,
        query_cell_types,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_atlas_is_valid() -> anyhow::Result<()> {
        let args = SimArgs {
            cell_types: 3,
            cells_per_type: 20,
            genes: 60,
            dim: 5,
            query_cells_per_donor: 15,
            ..Default::default()
        };
        let sim = simulate_atlas_and_query(&args)?;
        sim.atlas.validate()?;
        assert_eq!(sim.atlas.cells.len(), 60);
        assert_eq!(sim.atlas.dim(), 5);
        assert_eq!(sim.query.num_cells(), 30);
        assert_eq!(sim.query.group_labels(Some("donor"))?[29].as_ref(), "donor2");
        Ok(())
    }

    #[test]
    fn dimension_beyond_genes_is_rejected() {
        let args = SimArgs {
            genes: 5,
            dim: 10,
            ..Default::default()
        };
        assert!(simulate_atlas_and_query(&args).is_err());
    }
}
