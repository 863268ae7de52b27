use atlas_map::common::*;
use atlas_map::composition::*;
use atlas_map::output::*;

use clap::Args;
use matrix_util::common_io::read_lines;

#[derive(Args, Debug)]
pub struct CompositionCmdArgs {
    /// annotation table written by `map` (`.tsv` or `.tsv.gz`)
    #[arg(required = true)]
    annotation: Box<str>,

    /// output composition table
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// column with the labels to count
    #[arg(long, default_value = CELL_TYPE_COLUMN)]
    label_column: Box<str>,

    /// column with the donor of each cell
    #[arg(long, default_value = DONOR_COLUMN)]
    donor_column: Box<str>,

    /// column with the label confidence
    /// (defaults to the label column with a `_prob` suffix)
    #[arg(long)]
    confidence_column: Option<Box<str>>,

    /// file with category names, one per line, in output order
    #[arg(long)]
    categories: Option<Box<str>>,

    /// table shape
    #[arg(long, value_enum, default_value_t = CompositionShape::Proportion)]
    shape: CompositionShape,

    /// drop cells with lower label confidence
    #[arg(long)]
    confidence_cutoff: Option<f32>,

    /// count QC-failed cells (as unassigned)
    #[arg(long, default_value_t = false)]
    include_failed: bool,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

pub fn run_composition(args: &CompositionCmdArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    let confidence_column = match args.confidence_column.as_deref() {
        Some(column) => column.into(),
        None => confidence_column_for(&args.label_column),
    };

    let records = read_composition_records(
        &args.annotation,
        &args.label_column,
        &args.donor_column,
        &confidence_column,
    )?;
    info!("read {} cells from {}", records.len(), args.annotation);

    let categories = match args.categories.as_deref() {
        Some(file) => read_lines(file)?,
        None => vec![],
    };

    let comp_args = CompositionArgs {
        confidence_cutoff: args.confidence_cutoff,
        include_failed: args.include_failed,
        categories,
    };

    let table = aggregate_composition(&records, &comp_args)?;
    write_composition(&args.out, &table, args.shape)?;
    Ok(())
}
