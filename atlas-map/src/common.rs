pub use log::{info, warn};
pub use std::sync::Arc;

pub const DEFAULT_KNN: usize = 30;
pub const DEFAULT_UMAP_KNN: usize = 15;
pub const DEFAULT_MAD_THRESHOLD: f32 = 2.5;
pub const DEFAULT_MIN_CELLS_PER_GROUP: usize = 10;
pub const DEFAULT_BLOCK_SIZE: usize = 1000;

/// category for counted cells without a label
pub const UNASSIGNED: &str = "unassigned";

/// missing value in delimited text output
pub const NA: &str = "NA";

/// batch/donor name used when no grouping column is given
pub const GLOBAL_GROUP: &str = "all";

pub type Mat = nalgebra::DMatrix<f32>;
pub type DVec = nalgebra::DVector<f32>;
pub type CscMat = nalgebra_sparse::CscMatrix<f32>;

/// Mapping QC outcome of a query cell
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QcStatus {
    Pass,
    Fail,
}

impl QcStatus {
    pub fn is_pass(&self) -> bool {
        matches!(self, QcStatus::Pass)
    }
}

impl std::fmt::Display for QcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QcStatus::Pass => write!(f, "Pass"),
            QcStatus::Fail => write!(f, "Fail"),
        }
    }
}

impl std::str::FromStr for QcStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "Pass" | "pass" | "PASS" => Ok(QcStatus::Pass),
            "Fail" | "fail" | "FAIL" => Ok(QcStatus::Fail),
            _ => Err(anyhow::anyhow!("unknown QC status '{}'", s)),
        }
    }
}

/// `RUST_LOG=info` when verbose, then start the logger once
pub fn init_logger(verbose: bool) {
    if verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    let _ = env_logger::try_init();
}

/// Size the global rayon pool; `None` uses every logical CPU
pub fn init_thread_pool(threads: Option<usize>) -> anyhow::Result<()> {
    let max_threads = threads.unwrap_or_else(num_cpus::get).clamp(1, num_cpus::get().max(1));
    rayon::ThreadPoolBuilder::new()
        .num_threads(max_threads)
        .build_global()?;
    info!("will use {} threads", rayon::current_num_threads());
    Ok(())
}
