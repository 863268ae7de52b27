use crate::common::*;
use matrix_util::common_io::*;
use matrix_util::mtx_io::read_mtx_triplets;

use fnv::FnvHashMap as HashMap;
use nalgebra_sparse::CooMatrix;

/// Per-cell metadata table, rows aligned to the query cells
#[derive(Clone, Debug, Default)]
pub struct CellMetadata {
    pub columns: Vec<Box<str>>,
    /// `rows[j][c]` = value of column `c` for cell `j`
    pub rows: Vec<Vec<Box<str>>>,
}

impl CellMetadata {
    /// Read a delimited table with a header. The first column holds
    /// the cell ids; every query cell must appear exactly once and no
    /// other cell may appear.
    pub fn from_file(file: &str, cells: &[Box<str>]) -> anyhow::Result<Self> {
        let ReadLinesOut { lines, header } =
            read_lines_of_words_delim(file, detect_delimiter(file), 0)?;

        if header.len() < 2 {
            return Err(anyhow::anyhow!(
                "{}: expected a cell id column and at least one metadata column",
                file
            ));
        }

        let cell_index: HashMap<&str, usize> = cells
            .iter()
            .enumerate()
            .map(|(j, c)| (c.as_ref(), j))
            .collect();

        let ncol = header.len() - 1;
        let mut rows: Vec<Option<Vec<Box<str>>>> = vec![None; cells.len()];

        for (i, words) in lines.into_iter().enumerate() {
            if words.len() != header.len() {
                return Err(anyhow::anyhow!(
                    "{}: row {} has {} fields, header has {}",
                    file,
                    i + 1,
                    words.len(),
                    header.len()
                ));
            }
            let cell = &words[0];
            let j = *cell_index.get(cell.as_ref()).ok_or_else(|| {
                anyhow::anyhow!("{}: cell {} is not in the count matrix", file, cell)
            })?;
            if rows[j].is_some() {
                return Err(anyhow::anyhow!("{}: duplicated cell {}", file, cell));
            }
            rows[j] = Some(words[1..].to_vec());
        }

        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(j, r)| {
                r.ok_or_else(|| anyhow::anyhow!("{}: no metadata for cell {}", file, cells[j]))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        debug_assert!(rows.iter().all(|r| r.len() == ncol));

        Ok(CellMetadata {
            columns: header[1..].to_vec(),
            rows,
        })
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.as_ref() == name)
    }

    /// Values of one column, in cell order
    pub fn column(&self, name: &str) -> anyhow::Result<Vec<Box<str>>> {
        let c = self.column_position(name).ok_or_else(|| {
            anyhow::anyhow!(
                "metadata has no column '{}' (available: {})",
                name,
                self.columns.join(", ")
            )
        })?;
        Ok(self.rows.iter().map(|r| r[c].clone()).collect())
    }
}

/// Raw query data: genes x cells counts with names and metadata
pub struct QueryData {
    pub counts: CscMat,
    pub genes: Vec<Box<str>>,
    pub cells: Vec<Box<str>>,
    pub metadata: CellMetadata,
}

impl QueryData {
    /// Check shapes and name uniqueness
    pub fn new(
        counts: CscMat,
        genes: Vec<Box<str>>,
        cells: Vec<Box<str>>,
        metadata: CellMetadata,
    ) -> anyhow::Result<Self> {
        if counts.nrows() != genes.len() || counts.ncols() != cells.len() {
            return Err(anyhow::anyhow!(
                "count matrix is {} x {} but there are {} genes and {} cells",
                counts.nrows(),
                counts.ncols(),
                genes.len(),
                cells.len()
            ));
        }

        if cells.is_empty() {
            return Err(anyhow::anyhow!("no query cells"));
        }

        check_unique(&genes, "gene")?;
        check_unique(&cells, "cell")?;

        if let Some(v) = counts.values().iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(anyhow::anyhow!("invalid count value {}", v));
        }

        if !metadata.rows.is_empty() && metadata.rows.len() != cells.len() {
            return Err(anyhow::anyhow!(
                "metadata has {} rows for {} cells",
                metadata.rows.len(),
                cells.len()
            ));
        }

        Ok(QueryData {
            counts,
            genes,
            cells,
            metadata,
        })
    }

    /// Read a Matrix Market file (genes x cells), the gene and cell
    /// names (first token per line), and optional metadata
    pub fn from_files(
        mtx_file: &str,
        genes_file: &str,
        cells_file: &str,
        metadata_file: Option<&str>,
    ) -> anyhow::Result<Self> {
        let genes = read_first_words(genes_file)?;
        let cells = read_first_words(cells_file)?;

        let mtx = read_mtx_triplets(mtx_file)?;
        let (nrow, ncol, _) = mtx.shape;
        if nrow != genes.len() || ncol != cells.len() {
            return Err(anyhow::anyhow!(
                "{} is {} x {} but {} lists {} genes and {} lists {} cells",
                mtx_file,
                nrow,
                ncol,
                genes_file,
                genes.len(),
                cells_file,
                cells.len()
            ));
        }

        let counts = csc_from_triplets(&mtx.triplets, nrow, ncol)?;

        let metadata = match metadata_file {
            Some(file) => CellMetadata::from_file(file, &cells)?,
            None => CellMetadata::default(),
        };

        info!(
            "query: {} genes x {} cells, {} non-zero entries",
            genes.len(),
            cells.len(),
            counts.nnz()
        );

        Self::new(counts, genes, cells, metadata)
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn num_genes(&self) -> usize {
        self.genes.len()
    }

    /// Group label per cell from a metadata column; without a key
    /// every cell is in one global group
    pub fn group_labels(&self, key: Option<&str>) -> anyhow::Result<Vec<Box<str>>> {
        match key {
            Some(k) => self.metadata.column(k),
            None => Ok(vec![GLOBAL_GROUP.into(); self.num_cells()]),
        }
    }
}

/// Sparse genes x cells matrix from 0-based triplets; duplicated
/// entries are summed
pub fn csc_from_triplets(
    triplets: &[(u64, u64, f32)],
    nrow: usize,
    ncol: usize,
) -> anyhow::Result<CscMat> {
    let rows = triplets.iter().map(|t| t.0 as usize).collect::<Vec<_>>();
    let cols = triplets.iter().map(|t| t.1 as usize).collect::<Vec<_>>();
    let vals = triplets.iter().map(|t| t.2).collect::<Vec<_>>();
    let coo = CooMatrix::try_from_triplets(nrow, ncol, rows, cols, vals)
        .map_err(|e| anyhow::anyhow!("invalid triplets: {}", e))?;
    Ok(CscMat::from(&coo))
}

fn read_first_words(file: &str) -> anyhow::Result<Vec<Box<str>>> {
    read_lines_of_words(file, -1)?
        .lines
        .into_iter()
        .enumerate()
        .map(|(i, words)| {
            words
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("{}: empty line {}", file, i + 1))
        })
        .collect()
}

fn check_unique(names: &[Box<str>], what: &str) -> anyhow::Result<()> {
    let mut seen: HashMap<&str, ()> = HashMap::default();
    for x in names {
        if seen.insert(x.as_ref(), ()).is_some() {
            return Err(anyhow::anyhow!("duplicated {} {}", what, x));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_util::mtx_io::write_mtx_triplets;

    fn write_query(dir: &std::path::Path, meta: &[&str]) -> anyhow::Result<(String, String, String, String)> {
        let path = |f: &str| dir.join(f).to_str().unwrap().to_string();
        let (mtx, genes, cells, meta_file) = (
            path("x.mtx.gz"),
            path("genes.tsv"),
            path("cells.tsv"),
            path("meta.tsv"),
        );
        write_mtx_triplets(&[(0, 0, 3.0), (1, 1, 2.0), (2, 2, 1.0)], 3, 3, &mtx)?;
        write_lines(&["g1".into(), "g2".into(), "g3".into()], &genes)?;
        write_lines(&["c1".into(), "c2".into(), "c3".into()], &cells)?;
        let meta = meta.iter().map(|&x| x.into()).collect::<Vec<Box<str>>>();
        write_lines(&meta, &meta_file)?;
        Ok((mtx, genes, cells, meta_file))
    }

    #[test]
    fn metadata_is_aligned_to_cells() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (mtx, genes, cells, meta) = write_query(
            dir.path(),
            &["cell\tdonor", "c3\td2", "c1\td1", "c2\td1"],
        )?;
        let query = QueryData::from_files(&mtx, &genes, &cells, Some(&meta))?;
        assert_eq!(query.num_cells(), 3);
        let donors = query.group_labels(Some("donor"))?;
        let expected: Vec<Box<str>> = vec!["d1".into(), "d1".into(), "d2".into()];
        assert_eq!(donors, expected);
        assert!(query.group_labels(Some("batch")).is_err());
        assert_eq!(query.group_labels(None)?[0].as_ref(), GLOBAL_GROUP);
        Ok(())
    }

    #[test]
    fn mismatched_metadata_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (mtx, genes, cells, meta) =
            write_query(dir.path(), &["cell\tdonor", "c1\td1", "c2\td1"])?;
        assert!(QueryData::from_files(&mtx, &genes, &cells, Some(&meta)).is_err());

        let (mtx, genes, cells, meta) = write_query(
            dir.path(),
            &["cell\tdonor", "c1\td1", "c2\td1", "c2\td2", "c3\td1"],
        )?;
        assert!(QueryData::from_files(&mtx, &genes, &cells, Some(&meta)).is_err());

        let (mtx, genes, cells, meta) = write_query(
            dir.path(),
            &["cell\tdonor", "c1\td1", "c2\td1", "c4\td1"],
        )?;
        assert!(QueryData::from_files(&mtx, &genes, &cells, Some(&meta)).is_err());
        Ok(())
    }

    #[test]
    fn shape_must_match_names() -> anyhow::Result<()> {
        let counts = csc_from_triplets(&[(0, 0, 1.0)], 2, 2)?;
        let genes = vec!["g1".into(), "g2".into(), "g3".into()];
        let cells = vec!["c1".into(), "c2".into()];
        assert!(QueryData::new(counts, genes, cells, CellMetadata::default()).is_err());

        let counts = csc_from_triplets(&[(0, 0, 1.0)], 2, 2)?;
        let genes = vec!["g1".into(), "g1".into()];
        let cells = vec!["c1".into(), "c2".into()];
        assert!(QueryData::new(counts, genes, cells, CellMetadata::default()).is_err());
        Ok(())
    }
}
