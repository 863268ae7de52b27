use atlas_map::atlas::ReferenceAtlas;
use atlas_map::common::*;
use atlas_map::composition::*;
use atlas_map::gene_set_score::*;
use atlas_map::harmonize::HarmonizeArgs;
use atlas_map::label_transfer::LabelTransferArgs;
use atlas_map::mapper::SymphonyMapper;
use atlas_map::mapping_error::{MappingQcArgs, MetricKind};
use atlas_map::output::*;
use atlas_map::pipeline::{ProjectionArgs, ProjectionPipeline};
use atlas_map::query_input::QueryData;

use clap::Args;
use matrix_util::knn_match::{SearchMode, DEFAULT_EXACT_SEARCH_MAX};

#[derive(Args, Debug)]
pub struct MapArgs {
    /// reference atlas bundle (`.json` or `.json.gz`)
    #[arg(long, short, required = true)]
    atlas: Box<str>,

    /// query counts, genes x cells (`.mtx` or `.mtx.gz`)
    #[arg(long, short, required = true)]
    mtx: Box<str>,

    /// gene names, one per line (first token)
    #[arg(long, short, required = true)]
    genes: Box<str>,

    /// cell names, one per line (first token)
    #[arg(long, short, required = true)]
    cells: Box<str>,

    /// cell metadata with a header; first column = cell name
    #[arg(long)]
    metadata: Option<Box<str>>,

    /// metadata column of batch membership for harmonization
    #[arg(long, short)]
    batch_key: Option<Box<str>>,

    /// metadata column of donors for QC and composition
    /// (defaults to the batch key)
    #[arg(long, short)]
    donor_key: Option<Box<str>>,

    /// output annotation table (`.tsv`, `.tsv.gz` or `.parquet`)
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// output harmonized embedding (`.tsv`, `.tsv.gz` or `.parquet`)
    #[arg(long)]
    embedding_out: Option<Box<str>>,

    /// mapping-error metric
    #[arg(long, value_enum, default_value_t = MetricKind::Mahalanobis)]
    metric: MetricKind,

    /// cells with mapping error above `median + k * MAD` fail QC
    #[arg(long, default_value_t = DEFAULT_MAD_THRESHOLD)]
    mad_threshold: f32,

    /// MAD multiplier (1.4826 for a normal-consistent MAD)
    #[arg(long, default_value_t = 1.0)]
    mad_consistency: f32,

    /// estimate one QC threshold per donor
    #[arg(long, default_value_t = false)]
    qc_by_donor: bool,

    /// batches with fewer cells are pooled
    #[arg(long, default_value_t = DEFAULT_MIN_CELLS_PER_GROUP)]
    min_cells_per_batch: usize,

    /// donors with fewer cells use the global QC threshold
    #[arg(long, default_value_t = DEFAULT_MIN_CELLS_PER_GROUP)]
    min_cells_per_donor: usize,

    /// #k-nearest reference neighbours for labels and pseudotime
    #[arg(long, short = 'k', default_value_t = DEFAULT_KNN)]
    knn: usize,

    /// #k-nearest reference neighbours for UMAP projection
    #[arg(long, default_value_t = DEFAULT_UMAP_KNN)]
    umap_knn: usize,

    /// exact neighbour search up to this many reference cells, HNSW beyond
    #[arg(long, default_value_t = DEFAULT_EXACT_SEARCH_MAX)]
    exact_search_max: usize,

    /// gene sets for AUCell scores (one set per line, `.gmt` allowed)
    #[arg(long)]
    gene_sets: Option<Box<str>>,

    /// fraction of top-ranked genes for AUCell
    #[arg(long, default_value_t = DEFAULT_MAX_RANK_FRACTION)]
    max_rank_fraction: f32,

    /// minimum number of genes of a set found in the data
    #[arg(long, default_value_t = DEFAULT_MIN_GENES)]
    min_genes: usize,

    /// output composition table
    #[arg(long)]
    composition_out: Option<Box<str>>,

    /// composition table shape
    #[arg(long, value_enum, default_value_t = CompositionShape::Proportion)]
    composition_shape: CompositionShape,

    /// drop cells with lower label confidence from the composition
    #[arg(long)]
    confidence_cutoff: Option<f32>,

    /// count QC-failed cells (as unassigned) in the composition
    #[arg(long, default_value_t = false)]
    include_failed: bool,

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

impl MapArgs {
    fn projection_args(&self) -> ProjectionArgs {
        ProjectionArgs {
            harmonize: HarmonizeArgs {
                batch_key: self.batch_key.clone(),
                min_cells_per_batch: self.min_cells_per_batch,
                block_size: self.block_size,
            },
            donor_key: self.donor_key.clone(),
            qc: MappingQcArgs {
                mad_threshold: self.mad_threshold,
                by_donor: self.qc_by_donor,
                min_cells_per_donor: self.min_cells_per_donor,
                mad_consistency: self.mad_consistency,
            },
            label: LabelTransferArgs {
                knn: self.knn,
                umap_knn: self.umap_knn,
            },
        }
    }

    fn aucell_args(&self) -> AucellArgs {
        AucellArgs {
            max_rank_fraction: self.max_rank_fraction,
            min_genes: self.min_genes,
            block_size: self.block_size,
        }
    }
}

pub fn run_map(args: &MapArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);
    init_thread_pool(args.threads)?;

    let search = SearchMode::Auto(args.exact_search_max);
    let atlas = Arc::new(ReferenceAtlas::load(&args.atlas, search)?);

    let query = QueryData::from_files(&args.mtx, &args.genes, &args.cells, args.metadata.as_deref())?;

    let gene_sets = match args.gene_sets.as_deref() {
        Some(file) => Some(read_gene_sets(file)?),
        None => None,
    };

    let mapper = Arc::new(SymphonyMapper::new(atlas.clone()));
    let metric = args.metric.build(args.knn);
    let pipeline = ProjectionPipeline::new(mapper, metric);

    let annotated = pipeline.run(&query, &args.projection_args())?;

    let gene_set_scores = match gene_sets {
        Some(sets) => {
            Some(aucell_scores(&query, &sets, &args.aucell_args())?)
        }
        None => None,
    };

    write_annotation_table(&args.out, &annotated, gene_set_scores.as_ref())?;

    if let Some(file) = args.embedding_out.as_deref() {
        write_embedding(
            file,
            annotated.cells(),
            &annotated.scored.harmonized.embedding,
        )?;
    }

    if let Some(file) = args.composition_out.as_deref() {
        let comp_args = CompositionArgs {
            confidence_cutoff: args.confidence_cutoff,
            include_failed: args.include_failed,
            categories: atlas.cell_type_levels().to_vec(),
        };
        let table = aggregate_composition(&composition_records(&annotated), &comp_args)?;
        write_composition(file, &table, args.composition_shape)?;
    }

    Ok(())
}
