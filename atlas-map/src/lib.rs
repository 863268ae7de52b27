pub mod atlas; // reference atlas bundle and neighbour indexes
pub mod common;
pub mod composition; // per-donor composition tables
pub mod gene_set_score; // AUCell
pub mod harmonize; // query normalization, projection and batch correction
pub mod label_transfer; // KNN votes and pseudotime
pub mod mapper;
pub mod mapping_error; // mapping-error scores and MAD QC
pub mod output;
pub mod pipeline;
pub mod query_input;
pub mod simulate;
pub mod umap_transform;
