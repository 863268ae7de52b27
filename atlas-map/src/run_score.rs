use atlas_map::common::*;
use atlas_map::gene_set_score::*;
use atlas_map::output::write_gene_set_scores;
use atlas_map::query_input::QueryData;

use clap::Args;

#[derive(Args, Debug)]
pub struct ScoreGeneSetsArgs {
    /// query counts, genes x cells (`.mtx` or `.mtx.gz`)
    #[arg(long, short, required = true)]
    mtx: Box<str>,

    /// gene names, one per line (first token)
    #[arg(long, short, required = true)]
    genes: Box<str>,

    /// cell names, one per line (first token)
    #[arg(long, short, required = true)]
    cells: Box<str>,

    /// gene sets (one set per line, `.gmt` allowed)
    #[arg(long, short = 's', required = true)]
    gene_sets: Box<str>,

    /// output cells x gene sets table
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// fraction of top-ranked genes in the area
    #[arg(long, default_value_t = DEFAULT_MAX_RANK_FRACTION)]
    max_rank_fraction: f32,

    /// minimum number of genes of a set found in the data
    #[arg(long, default_value_t = DEFAULT_MIN_GENES)]
    min_genes: usize,

    /// block_size (# columns) for parallel processing
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// maximum number of threads
    #[arg(long)]
    threads: Option<usize>,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

pub fn run_score_gene_sets(args: &ScoreGeneSetsArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);
    init_thread_pool(args.threads)?;

    let query = QueryData::from_files(&args.mtx, &args.genes, &args.cells, None)?;
    let sets = read_gene_sets(&args.gene_sets)?;

    let aucell = AucellArgs {
        max_rank_fraction: args.max_rank_fraction,
        min_genes: args.min_genes,
        block_size: args.block_size,
    };
    let scores = aucell_scores(&query, &sets, &aucell)?;

    write_gene_set_scores(&args.out, &query.cells, &scores)?;
    Ok(())
}
