pub mod common_io; // gzip-aware line reading and writing
pub mod dmatrix_util; // column-wise operations on nalgebra matrices
pub mod fuzzy_kernel; // UMAP-style neighbour membership weights
pub mod knn_match; // nearest neighbour look-up (exact or HNSW)
pub mod mtx_io; // MatrixMarket triplets
pub mod parquet; // flat table output
pub mod robust_stat; // median and MAD
pub mod traits;
pub mod utils;
