use indicatif::ParallelProgressIterator;
use instant_distance::{Builder, HnswMap, Search};
use rayon::prelude::*;
use std::cmp::Ordering;

/// Above this many points `SearchMode::Auto` switches to HNSW
pub const DEFAULT_EXACT_SEARCH_MAX: usize = 20_000;

const HNSW_SEED: u64 = 42;

/// Candidate list size of an HNSW search; larger `knn` scan every point
pub const HNSW_EF_SEARCH: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchMode {
    /// brute-force scan; exact and deterministic
    Exact,
    /// approximate search on a hierarchical navigable small world graph
    Hnsw,
    /// exact for dictionaries up to the given size, HNSW beyond
    Auto(usize),
}

impl Default for SearchMode {
    fn default() -> Self {
        SearchMode::Auto(DEFAULT_EXACT_SEARCH_MAX)
    }
}

/// Neighbours of one query, sorted by `(distance, index)`
#[derive(Clone, Debug, Default)]
pub struct Neighbours {
    pub indices: Vec<usize>,
    pub distances: Vec<f32>,
}

impl Neighbours {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    fn from_pairs(mut pairs: Vec<(usize, f32)>, knn: usize) -> Self {
        pairs.sort_by(cmp_distance_then_index);
        pairs.truncate(knn);
        let (indices, distances) = pairs.into_iter().unzip();
        Neighbours { indices, distances }
    }
}

fn cmp_distance_then_index(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    a.1.total_cmp(&b.1).then(a.0.cmp(&b.0))
}

/// A dictionary of column vectors for fast look-up of nearest
/// neighbours. Built once and then only read, so it can be shared
/// across threads.
pub struct ColumnDict {
    hnsw: Option<HnswMap<VecPoint, usize>>,
    data_vec: Vec<VecPoint>,
    dim: usize,
}

impl ColumnDict {
    /// Build a dictionary from the columns of `data` (d x n)
    pub fn from_columns(data: &nalgebra::DMatrix<f32>, mode: SearchMode) -> Self {
        let views = data.column_iter().collect::<Vec<_>>();
        Self::from_column_views(views, data.nrows(), mode)
    }

    pub fn from_column_views<V>(data: Vec<V>, dim: usize, mode: SearchMode) -> Self
    where
        V: Sync + MakeVecPoint,
    {
        let nn = data.len();
        let data_vec: Vec<VecPoint> = data
            .par_iter()
            .progress_count(nn as u64)
            .map(|x| x.to_vp())
            .collect();
        Self::from_vec_points(data_vec, dim, mode)
    }

    fn from_vec_points(data_vec: Vec<VecPoint>, dim: usize, mode: SearchMode) -> Self {
        let nn = data_vec.len();
        let use_hnsw = match mode {
            SearchMode::Exact => false,
            SearchMode::Hnsw => true,
            SearchMode::Auto(max_exact) => nn > max_exact,
        };

        let hnsw = if use_hnsw {
            let names = (0..nn).collect::<Vec<_>>();
            Some(
                Builder::default()
                    .ef_search(HNSW_EF_SEARCH)
                    .seed(HNSW_SEED)
                    .build(data_vec.clone(), names),
            )
        } else {
            None
        };

        ColumnDict {
            hnsw,
            data_vec,
            dim,
        }
    }

    pub fn is_exact(&self) -> bool {
        self.hnsw.is_none()
    }

    /// k-nearest neighbours of a query vector
    ///
    /// * `query` - a vector of length `dim`
    /// * `knn` - number of neighbours, clamped to the dictionary size;
    ///   above `HNSW_EF_SEARCH` the search is exact
    ///
    pub fn search_by_query_data(&self, query: &[f32], knn: usize) -> anyhow::Result<Neighbours> {
        if query.len() != self.dim {
            return Err(anyhow::anyhow!(
                "query dimension {} != dictionary dimension {}",
                query.len(),
                self.dim
            ));
        }

        if knn == 0 {
            return Err(anyhow::anyhow!("number of neighbours must be positive"));
        }

        let nquery = knn.min(self.data_vec.len());
        let query = VecPoint {
            data: query.to_vec(),
        };

        let pairs: Vec<(usize, f32)> = match &self.hnsw {
            Some(hnsw) if nquery <= HNSW_EF_SEARCH => {
                let mut search = Search::default();
                hnsw.search(&query, &mut search)
                    .take(nquery)
                    .map(|item| (*item.value, item.distance))
                    .collect()
            }
            _ => self
                .data_vec
                .iter()
                .enumerate()
                .map(|(j, x)| (j, euclidean(&query.data, &x.data)))
                .collect(),
        };

        Ok(Neighbours::from_pairs(pairs, nquery))
    }

    /// k-nearest neighbours of the columns of `queries` (d x m), in
    /// column order
    pub fn search_columns(
        &self,
        queries: &nalgebra::DMatrix<f32>,
        knn: usize,
    ) -> anyhow::Result<Vec<Neighbours>> {
        let nq = queries.ncols();
        (0..nq)
            .into_par_iter()
            .progress_count(nq as u64)
            .map(|j| {
                let q = queries.column(j).iter().copied().collect::<Vec<_>>();
                self.search_by_query_data(&q, knn)
            })
            .collect()
    }
}

fn euclidean(x: &[f32], y: &[f32]) -> f32 {
    x.iter()
        .zip(y.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f32>()
        .sqrt()
}

#[derive(Clone, Debug)]
/// a wrapper for Vec<f32>
pub struct VecPoint {
    pub data: Vec<f32>,
}

pub trait MakeVecPoint {
    fn to_vp(&self) -> VecPoint;
}

impl MakeVecPoint for nalgebra::DVectorView<'_, f32> {
    fn to_vp(&self) -> VecPoint {
        VecPoint {
            data: self.iter().cloned().collect(),
        }
    }
}

impl instant_distance::Point for VecPoint {
    fn distance(&self, other: &Self) -> f32 {
        euclidean(&self.data, &other.data)
    }
}
