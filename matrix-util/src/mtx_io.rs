use crate::common_io::*;
use std::io::Write;

/// Triplets `(row, col, value)` with 0-based indices and the shape
/// `(nrow, ncol, nnz)` declared in the header
pub struct MtxTriplets {
    pub triplets: Vec<(u64, u64, f32)>,
    pub shape: (usize, usize, usize),
}

/// Write the triplets into a MatrixMarket file with 1-based indices
/// * `triplets` - the triplets to write
/// * `nrow` - number of rows
/// * `ncol` - number of columns
/// * `mtx_file` - the output file (e.g., "matrix.mtx.gz")
pub fn write_mtx_triplets(
    triplets: &[(u64, u64, f32)],
    nrow: usize,
    ncol: usize,
    mtx_file: &str,
) -> anyhow::Result<()> {
    mkdir(mtx_file)?;

    let mut buf = open_buf_writer(mtx_file)?;

    let nnz = triplets.len();
    writeln!(buf, "%%MatrixMarket matrix coordinate real general")?;
    writeln!(buf, "{}\t{}\t{}", nrow, ncol, nnz)?;

    for (row, col, val) in triplets {
        writeln!(buf, "{}\t{}\t{}", row + 1, col + 1, val)?;
    }

    buf.flush()?;
    Ok(())
}

/// Convert a triplet of strings to a triplet of 0-based (row, col, val).
/// Count data: values must be finite and non-negative.
fn parse_row_col_val(triplet: &[Box<str>], nrow: usize, ncol: usize) -> anyhow::Result<(u64, u64, f32)> {
    if triplet.len() != 3 {
        return Err(anyhow::anyhow!(
            "expected 3 fields, found {}",
            triplet.len()
        ));
    }

    let row = triplet[0]
        .parse::<u64>()
        .map_err(|_| anyhow::anyhow!("invalid row index '{}'", triplet[0]))?;
    let col = triplet[1]
        .parse::<u64>()
        .map_err(|_| anyhow::anyhow!("invalid column index '{}'", triplet[1]))?;
    let val = triplet[2]
        .parse::<f32>()
        .map_err(|_| anyhow::anyhow!("non-numeric value '{}'", triplet[2]))?;

    if row == 0 || row as usize > nrow || col == 0 || col as usize > ncol {
        return Err(anyhow::anyhow!(
            "index ({}, {}) outside of {} x {}",
            row,
            col,
            nrow,
            ncol
        ));
    }

    if !val.is_finite() || val < 0.0 {
        return Err(anyhow::anyhow!("invalid count value {}", val));
    }

    Ok((row - 1, col - 1, val))
}

/// Read a matrix market file and return a vector of triplets (row, col, val).
/// Any malformed entry fails the whole read.
/// * `mtx_file` - Path to the matrix market file
pub fn read_mtx_triplets(mtx_file: &str) -> anyhow::Result<MtxTriplets> {
    let ReadLinesOut {
        lines,
        header: mtx_hdr,
    } = read_lines_of_words(mtx_file, 0)?;

    if mtx_hdr.len() != 3 {
        return Err(anyhow::anyhow!("failed to parse mtx header: {}", mtx_file));
    }

    let nrow = mtx_hdr[0].parse::<usize>()?;
    let ncol = mtx_hdr[1].parse::<usize>()?;
    let nnz = mtx_hdr[2].parse::<usize>()?;

    if lines.len() != nnz {
        return Err(anyhow::anyhow!(
            "{}: header declares {} entries but found {}",
            mtx_file,
            nnz,
            lines.len()
        ));
    }

    let mut triplets = lines
        .iter()
        .enumerate()
        .map(|(i, words)| {
            parse_row_col_val(words, nrow, ncol)
                .map_err(|e| anyhow::anyhow!("{}: entry {}: {}", mtx_file, i + 1, e))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    triplets.sort_by_key(|&(row, col, _)| (col, row));

    Ok(MtxTriplets {
        triplets,
        shape: (nrow, ncol, nnz),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_small_matrix() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("x.mtx.gz");
        let file = file.to_str().unwrap();

        let triplets = vec![(0, 0, 1.0), (2, 0, 3.0), (1, 1, 5.0)];
        write_mtx_triplets(&triplets, 3, 2, file)?;

        let out = read_mtx_triplets(file)?;
        assert_eq!(out.shape, (3, 2, 3));
        assert_eq!(out.triplets, vec![(0, 0, 1.0), (2, 0, 3.0), (1, 1, 5.0)]);
        Ok(())
    }

    #[test]
    fn reject_non_numeric_counts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("bad.mtx");
        std::fs::write(
            &file,
            "%%MatrixMarket matrix coordinate real general\n2 2 2\n1 1 3\n2 2 abc\n",
        )?;
        assert!(read_mtx_triplets(file.to_str().unwrap()).is_err());
        Ok(())
    }

    #[test]
    fn reject_out_of_range_and_negative() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("bad.mtx");
        std::fs::write(&file, "%%MatrixMarket\n2 2 1\n3 1 1\n")?;
        assert!(read_mtx_triplets(file.to_str().unwrap()).is_err());

        std::fs::write(&file, "%%MatrixMarket\n2 2 1\n1 1 -2\n")?;
        assert!(read_mtx_triplets(file.to_str().unwrap()).is_err());
        Ok(())
    }
}
