//! AUCell gene-set activity scores.
//!
//! Genes are ranked within each cell by raw count. The score of a gene
//! set is the area under its recovery curve over the top `max_rank`
//! genes, relative to the best area the set could reach.

use crate::common::*;
use crate::query_input::QueryData;

use fnv::FnvHashMap as HashMap;
use indicatif::ParallelProgressIterator;
use matrix_util::common_io::{file_ext, read_lines_of_words};
use matrix_util::utils::generate_minibatch_intervals;
use rayon::prelude::*;

pub const DEFAULT_MAX_RANK_FRACTION: f32 = 0.05;
pub const DEFAULT_MIN_GENES: usize = 1;

#[derive(Clone, Debug)]
pub struct GeneSet {
    pub name: Box<str>,
    pub genes: Vec<Box<str>>,
}

/// One set per line: name, then genes. In `.gmt` files the second
/// token is a description and is skipped.
pub fn read_gene_sets(file: &str) -> anyhow::Result<Vec<GeneSet>> {
    let skip = match file_ext(file).as_deref() {
        Ok("gmt") => 2,
        _ => 1,
    };

    let lines = read_lines_of_words(file, -1)?.lines;
    let mut sets = Vec::with_capacity(lines.len());

    for (i, words) in lines.into_iter().enumerate() {
        if words.len() <= skip {
            return Err(anyhow::anyhow!("{}: gene set on line {} has no genes", file, i + 1));
        }
        sets.push(GeneSet {
            name: words[0].clone(),
            genes: words[skip..].to_vec(),
        });
    }

    info!("read {} gene sets from {}", sets.len(), file);
    Ok(sets)
}

#[derive(Clone, Debug)]
pub struct AucellArgs {
    /// fraction of the genes that count towards the area
    pub max_rank_fraction: f32,
    /// sets with fewer genes in the data are skipped
    pub min_genes: usize,
    pub block_size: usize,
}

impl Default for AucellArgs {
    fn default() -> Self {
        AucellArgs {
            max_rank_fraction: DEFAULT_MAX_RANK_FRACTION,
            min_genes: DEFAULT_MIN_GENES,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// cells x sets
pub struct GeneSetScores {
    pub set_names: Vec<Box<str>>,
    pub scores: Mat,
}

/// Rank (1-based) of every expressed gene in one cell: descending by
/// count, ties by gene index
fn expressed_ranks(rows: &[usize], values: &[f32]) -> Vec<(usize, usize)> {
    let mut order = rows
        .iter()
        .zip(values.iter())
        .filter(|&(_, &v)| v > 0.0)
        .map(|(&g, &v)| (g, v))
        .collect::<Vec<_>>();
    order.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    order
        .into_iter()
        .enumerate()
        .map(|(r, (g, _))| (g, r + 1))
        .collect()
}

/// AUC of one set given the rank of each of its genes
fn recovery_auc(ranks: &[usize], max_rank: usize) -> f32 {
    let area = ranks
        .iter()
        .filter(|&&r| r <= max_rank)
        .map(|&r| (max_rank - r + 1) as f32)
        .sum::<f32>();
    let best = (1..=ranks.len().min(max_rank))
        .map(|i| (max_rank - i + 1) as f32)
        .sum::<f32>();
    if best > 0.0 {
        area / best
    } else {
        0.0
    }
}

/// AUCell score of every cell for every gene set with at least
/// `min_genes` genes in the query
pub fn aucell_scores(
    query: &QueryData,
    gene_sets: &[GeneSet],
    args: &AucellArgs,
) -> anyhow::Result<GeneSetScores> {
    if !(args.max_rank_fraction > 0.0 && args.max_rank_fraction <= 1.0) {
        return Err(anyhow::anyhow!(
            "max rank fraction must be in (0, 1], got {}",
            args.max_rank_fraction
        ));
    }

    let ngenes = query.num_genes();
    let max_rank = ((args.max_rank_fraction * ngenes as f32).ceil() as usize).clamp(1, ngenes.max(1));

    let gene_index: HashMap<&str, usize> = query
        .genes
        .iter()
        .enumerate()
        .map(|(i, g)| (g.as_ref(), i))
        .collect();

    let mut set_names = vec![];
    let mut set_genes: Vec<Vec<usize>> = vec![];
    for gs in gene_sets {
        let mut genes = gs
            .genes
            .iter()
            .filter_map(|g| gene_index.get(g.as_ref()).copied())
            .collect::<Vec<_>>();
        genes.sort();
        genes.dedup();
        if genes.len() < args.min_genes.max(1) {
            warn!(
                "gene set {}: {} of {} genes found; skipped",
                gs.name,
                genes.len(),
                gs.genes.len()
            );
            continue;
        }
        set_names.push(gs.name.clone());
        set_genes.push(genes);
    }

    info!(
        "AUCell: {} gene sets, top {} of {} genes",
        set_names.len(),
        max_rank,
        ngenes
    );

    let nn = query.num_cells();
    let nsets = set_names.len();
    let jobs = generate_minibatch_intervals(nn, args.block_size);

    let blocks = jobs
        .par_iter()
        .progress_count(jobs.len() as u64)
        .map(|&(lb, ub)| {
            let mut block = Mat::zeros(ub - lb, nsets);
            for j in lb..ub {
                let col = query.counts.col(j);
                let ranked = expressed_ranks(col.row_indices(), col.values());
                let nexpr = ranked.len();
                let mut expressed = ranked.iter().map(|&(g, _)| g).collect::<Vec<_>>();
                expressed.sort();
                let rank_of: HashMap<usize, usize> = ranked.into_iter().collect();

                for (s, genes) in set_genes.iter().enumerate() {
                    let ranks = genes
                        .iter()
                        .map(|&g| match rank_of.get(&g) {
                            Some(&r) => r,
                            None => {
                                // unexpressed genes follow, in index order
                                let below = expressed.partition_point(|&e| e < g);
                                nexpr + (g - below) + 1
                            }
                        })
                        .collect::<Vec<_>>();
                    block[(j - lb, s)] = recovery_auc(&ranks, max_rank);
                }
            }
            (lb, block)
        })
        .collect::<Vec<_>>();

    let mut scores = Mat::zeros(nn, nsets);
    for (lb, block) in blocks {
        scores.rows_mut(lb, block.nrows()).copy_from(&block);
    }

    Ok(GeneSetScores { set_names, scores })
}
