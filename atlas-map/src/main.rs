mod run_composition;
mod run_map;
mod run_score;
mod run_sim;

use run_composition::*;
use run_map::*;
use run_score::*;
use run_sim::*;

use atlas_map::common::info;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "ATLAS-MAP",
    long_about = "Project single-cell query data onto a reference atlas\n\
		  and transfer cell types, cycle phases and pseudotime.\n\
		  Counts come as Matrix Market (`.mtx`, `.mtx.gz`) with\n\
		  gene and cell name files."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Map query cells onto a reference atlas",
        long_about = "Map query cells in four stages:\n\
		      (1) Harmonize: normalize, project and correct batch effects\n\
		      (2) Score mapping error and flag outliers by MAD\n\
		      (3) Project into the reference UMAP\n\
		      (4) Transfer labels and pseudotime from reference neighbours\n"
    )]
    Map(MapArgs),

    #[command(
        about = "Per-donor cell-type composition from an annotation table",
        visible_alias = "comp"
    )]
    Composition(CompositionCmdArgs),

    #[command(about = "AUCell gene-set scores of query cells")]
    ScoreGeneSets(ScoreGeneSetsArgs),

    /// simulate a reference atlas and query data
    Simulate(SimulateArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Map(args) => {
            run_map(args)?;
        }
        Commands::Composition(args) => {
            run_composition(args)?;
        }
        Commands::ScoreGeneSets(args) => {
            run_score_gene_sets(args)?;
        }
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
    }

    info!("Done");
    Ok(())
}
