use atlas_map::common::*;
use atlas_map::simulate::*;

use clap::Args;
use matrix_util::common_io::*;
use matrix_util::mtx_io::write_mtx_triplets;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// number of reference cell types
    #[arg(long, default_value_t = 4)]
    cell_types: usize,

    /// reference cells per type
    #[arg(long, default_value_t = 100)]
    cells_per_type: usize,

    /// number of genes
    #[arg(long, default_value_t = 200)]
    genes: usize,

    /// marker genes per type
    #[arg(long, default_value_t = 10)]
    markers_per_type: usize,

    /// embedding dimension
    #[arg(long, short = 'd', default_value_t = 10)]
    dim: usize,

    /// expected count per cell
    #[arg(long, default_value_t = 2000)]
    depth: usize,

    /// number of query donors
    #[arg(long, default_value_t = 2)]
    donors: usize,

    /// query cells per donor
    #[arg(long, default_value_t = 100)]
    cells_per_donor: usize,

    /// standard deviation of the log donor effect per gene
    #[arg(long, default_value_t = 0.3)]
    donor_effect: f32,

    /// standard deviation of reference pseudotime noise
    #[arg(long, default_value_t = 0.0)]
    pseudotime_jitter: f32,

    /// random seed
    #[arg(long, default_value_t = 42)]
    rseed: u64,

    /// output header
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

/// Writes
/// - `{out}.atlas.json.gz`
/// - `{out}.mtx.gz`, `{out}.genes.gz`, `{out}.cells.gz`
/// - `{out}.metadata.tsv.gz` (cell, donor, true cell type)
pub fn run_simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    let sim_args = SimArgs {
        cell_types: args.cell_types,
        cells_per_type: args.cells_per_type,
        genes: args.genes,
        markers_per_type: args.markers_per_type,
        dim: args.dim,
        depth: args.depth,
        query_donors: args.donors,
        query_cells_per_donor: args.cells_per_donor,
        donor_effect: args.donor_effect,
        pseudotime_jitter: args.pseudotime_jitter,
        rseed: args.rseed,
    };

    let sim = simulate_atlas_and_query(&sim_args)?;

    let atlas_file = format!("{}.atlas.json.gz", args.out);
    let mtx_file = format!("{}.mtx.gz", args.out);
    let genes_file = format!("{}.genes.gz", args.out);
    let cells_file = format!("{}.cells.gz", args.out);
    let metadata_file = format!("{}.metadata.tsv.gz", args.out);

    mkdir(&atlas_file)?;
    sim.atlas.save(&atlas_file)?;

    let query = &sim.query;
    let counts = &query.counts;
    let triplets = counts
        .triplet_iter()
        .map(|(i, j, &v)| (i as u64, j as u64, v))
        .collect::<Vec<_>>();
    write_mtx_triplets(&triplets, counts.nrows(), counts.ncols(), &mtx_file)?;
    write_lines(&query.genes, &genes_file)?;
    write_lines(&query.cells, &cells_file)?;

    let mut lines: Vec<Box<str>> = vec![format!("cell\t{}", query.metadata.columns.join("\t")).into()];
    lines.extend(
        query
            .cells
            .iter()
            .zip(query.metadata.rows.iter())
            .map(|(c, row)| format!("{}\t{}", c, row.join("\t")).into_boxed_str()),
    );
    write_lines(&lines, &metadata_file)?;

    info!(
        "wrote {}, {}, {}, {}, {}",
        atlas_file, mtx_file, genes_file, cells_file, metadata_file
    );
    Ok(())
}
