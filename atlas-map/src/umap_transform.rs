use crate::atlas::ReferenceAtlas;
use crate::common::*;

use matrix_util::fuzzy_kernel::fuzzy_membership_weights;

/// Place query cells in the reference UMAP (2 x n).
///
/// Each cell lands at the fuzzy-membership weighted mean of the UMAP
/// coordinates of its `umap_knn` nearest reference cells in the
/// harmonized space.
///
/// * `embedding` - harmonized query embedding (d x n)
/// * `cells` - query cell names, one per column
/// * `umap_knn` - number of neighbours, clamped to the reference size
///
pub fn project_to_reference_umap(
    atlas: &ReferenceAtlas,
    embedding: &Mat,
    cells: &[Box<str>],
    umap_knn: usize,
) -> anyhow::Result<Mat> {
    if cells.len() != embedding.ncols() {
        return Err(anyhow::anyhow!(
            "{} cell names for {} embedded cells",
            cells.len(),
            embedding.ncols()
        ));
    }

    info!(
        "projecting {} cells into the reference UMAP ({} neighbours)",
        embedding.ncols(),
        umap_knn
    );

    let neighbours = atlas.embedding_index().search_columns(embedding, umap_knn)?;

    let mut ret = Mat::zeros(2, embedding.ncols());
    for (j, nn) in neighbours.iter().enumerate() {
        let weights = fuzzy_membership_weights(&nn.distances);
        let total: f32 = weights.iter().sum();
        for (&i, &w) in nn.indices.iter().zip(weights.iter()) {
            ret[(0, j)] += w * atlas.umap[(0, i)] / total;
            ret[(1, j)] += w * atlas.umap[(1, i)] / total;
        }
        if !(total > 0.0) || !ret[(0, j)].is_finite() || !ret[(1, j)].is_finite() {
            return Err(anyhow::anyhow!(
                "cell {} has no finite position in the reference UMAP",
                cells[j]
            ));
        }
    }
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::{AtlasBundle, DenseBlock, ReferenceCell};
    use approx::assert_abs_diff_eq;
    use matrix_util::knn_match::SearchMode;

    /// three reference cells at (0,0), (1,0) and (0,3)
    fn three_cell_atlas() -> anyhow::Result<ReferenceAtlas> {
        let cell = |id: &str, embedding: [f32; 2], umap: [f32; 2]| ReferenceCell {
            id: id.into(),
            embedding: embedding.to_vec(),
            umap,
            cell_type: "T".into(),
            pseudotime: 0.0,
            cycle_phase: "G1".into(),
        };
        let block = |nrows: usize, ncols: usize, data: &[f32]| DenseBlock {
            nrows,
            ncols,
            data: data.to_vec(),
        };
        let bundle = AtlasBundle {
            name: "three".into(),
            scale_factor: 1e4,
            lambda: 1.0,
            genes: vec!["g1".into()],
            gene_means: vec![0.0],
            gene_sds: vec![1.0],
            loadings: block(1, 2, &[1.0, 0.0]),
            centroids: block(2, 1, &[1.0, 0.0]),
            cluster_sigma: vec![0.1],
            cluster_size: vec![3.0],
            cluster_moments: block(2, 1, &[1.0, 3.0]),
            broad_labels: Default::default(),
            cells: vec![
                cell("r0", [0.0, 0.0], [10.0, -2.0]),
                cell("r1", [1.0, 0.0], [4.0, 6.0]),
                cell("r2", [0.0, 3.0], [-8.0, 1.0]),
            ],
        };
        ReferenceAtlas::from_bundle(bundle, SearchMode::Exact)
    }

    fn weighted_umap(atlas: &ReferenceAtlas, indices: &[usize], distances: &[f32]) -> [f32; 2] {
        let weights = fuzzy_membership_weights(distances);
        let total: f32 = weights.iter().sum();
        let mut xy = [0.0; 2];
        for (&i, &w) in indices.iter().zip(weights.iter()) {
            xy[0] += w * atlas.umap[(0, i)] / total;
            xy[1] += w * atlas.umap[(1, i)] / total;
        }
        xy
    }

    #[test]
    fn single_neighbour_lands_on_its_cell() -> anyhow::Result<()> {
        let atlas = three_cell_atlas()?;
        let zz = Mat::from_column_slice(2, 2, &[1.0, 0.0, 0.1, 2.9]);
        let cells: Vec<Box<str>> = vec!["q0".into(), "q1".into()];
        let uu = project_to_reference_umap(&atlas, &zz, &cells, 1)?;
        assert_eq!(uu.shape(), (2, 2));
        assert_abs_diff_eq!(uu[(0, 0)], 4.0);
        assert_abs_diff_eq!(uu[(1, 0)], 6.0);
        assert_abs_diff_eq!(uu[(0, 1)], -8.0);
        assert_abs_diff_eq!(uu[(1, 1)], 1.0);
        Ok(())
    }

    #[test]
    fn position_is_the_membership_weighted_mean() -> anyhow::Result<()> {
        let atlas = three_cell_atlas()?;
        let zz = Mat::from_column_slice(2, 1, &[0.3, 0.4]);
        let cells: Vec<Box<str>> = vec!["q0".into()];
        let uu = project_to_reference_umap(&atlas, &zz, &cells, 3)?;

        // distances to r0, r1, r2 in nearest-first order
        let d0 = 0.5_f32;
        let d1 = (0.7_f32 * 0.7 + 0.4 * 0.4).sqrt();
        let d2 = (0.3_f32 * 0.3 + 2.6 * 2.6).sqrt();
        let xy = weighted_umap(&atlas, &[0, 1, 2], &[d0, d1, d2]);
        assert_abs_diff_eq!(uu[(0, 0)], xy[0], epsilon = 1e-4);
        assert_abs_diff_eq!(uu[(1, 0)], xy[1], epsilon = 1e-4);

        // strictly inside the hull: every neighbour contributes
        assert!(uu[(0, 0)] < 10.0 && uu[(0, 0)] > -8.0);
        Ok(())
    }

    #[test]
    fn neighbour_count_is_clamped_to_the_reference() -> anyhow::Result<()> {
        let atlas = three_cell_atlas()?;
        let zz = Mat::from_column_slice(2, 1, &[0.3, 0.4]);
        let cells: Vec<Box<str>> = vec!["q0".into()];
        let all = project_to_reference_umap(&atlas, &zz, &cells, 3)?;
        let many = project_to_reference_umap(&atlas, &zz, &cells, 100)?;
        assert_abs_diff_eq!(all[(0, 0)], many[(0, 0)], epsilon = 1e-6);
        assert_abs_diff_eq!(all[(1, 0)], many[(1, 0)], epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn failure_names_the_query_cell() -> anyhow::Result<()> {
        let atlas = three_cell_atlas()?;
        let zz = Mat::from_column_slice(2, 2, &[0.0, 0.0, f32::NAN, 1.0]);
        let cells: Vec<Box<str>> = vec!["ok_cell".into(), "bad_cell".into()];
        let err = project_to_reference_umap(&atlas, &zz, &cells, 2)
            .expect_err("a non-finite embedding cannot be placed");
        assert!(err.to_string().contains("bad_cell"), "{}", err);

        let short: Vec<Box<str>> = vec!["ok_cell".into()];
        assert!(project_to_reference_umap(&atlas, &zz, &short, 2).is_err());
        Ok(())
    }
}
