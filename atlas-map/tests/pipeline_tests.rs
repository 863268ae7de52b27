use atlas_map::atlas::*;
use atlas_map::common::*;
use atlas_map::composition::*;
use atlas_map::harmonize::*;
use atlas_map::label_transfer::*;
use atlas_map::mapper::SymphonyMapper;
use atlas_map::mapping_error::*;
use atlas_map::pipeline::*;
use atlas_map::query_input::*;
use atlas_map::simulate::*;

use approx::assert_abs_diff_eq;
use matrix_util::knn_match::SearchMode;
use std::collections::BTreeMap;

/// 50 "A" cells (pseudotime 0) around `(ln 2, 0)` and 50 "B" cells
/// (pseudotime 1) around `(0, ln 2)`; the first gene loads on the
/// first axis, the second gene on the second.
fn two_cluster_bundle() -> AtlasBundle {
    let l = 2_f32.ln();
    let mut cells = vec![];
    for (t, (name, phase, time)) in [("A", "G1", 0.0), ("B", "S", 1.0)].into_iter().enumerate() {
        for i in 0..50 {
            let (a, b) = (0.002 * (i % 5) as f32, 0.002 * (i / 5) as f32);
            let embedding = if t == 0 { vec![l + a, b] } else { vec![a, l + b] };
            let (u, v) = (0.1 * (i % 5) as f32, 0.1 * (i / 5) as f32);
            let umap = if t == 0 { [u, v] } else { [10.0 + u, v] };
            cells.push(ReferenceCell {
                id: format!("{}{}", name, i).into(),
                embedding,
                umap,
                cell_type: name.into(),
                pseudotime: time,
                cycle_phase: phase.into(),
            });
        }
    }

    let nn = cells.len();
    let zz = Mat::from_fn(2, nn, |i, j| cells[j].embedding[i]);
    let centroids = Mat::identity(2, 2);
    let sigma = DVec::from_element(2, 0.1);
    let rr = soft_cluster_assignment(&zz, &centroids, &sigma);

    let mut broad_labels = BTreeMap::new();
    broad_labels.insert("A".into(), "Alpha".into());

    AtlasBundle {
        name: "two-cluster".into(),
        scale_factor: 1.0,
        lambda: 1.0,
        genes: vec!["g1".into(), "g2".into(), "g3".into(), "g4".into()],
        gene_means: vec![0.0; 4],
        gene_sds: vec![1.0; 4],
        loadings: DenseBlock {
            nrows: 4,
            ncols: 2,
            data: vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
        },
        centroids: DenseBlock::from_mat(&centroids),
        cluster_sigma: vec![0.1, 0.1],
        cluster_size: rr.column_sum().iter().copied().collect(),
        cluster_moments: DenseBlock::from_mat(&(&zz * rr.transpose())),
        broad_labels,
        cells,
    }
}

fn two_cluster_atlas() -> anyhow::Result<Arc<ReferenceAtlas>> {
    Ok(Arc::new(ReferenceAtlas::from_bundle(
        two_cluster_bundle(),
        SearchMode::Exact,
    )?))
}

fn pipeline(atlas: Arc<ReferenceAtlas>, metric: MetricKind) -> ProjectionPipeline {
    ProjectionPipeline::new(Arc::new(SymphonyMapper::new(atlas)), metric.build(DEFAULT_KNN))
}

#[test]
fn query_on_a_reference_cell_takes_its_labels() -> anyhow::Result<()> {
    let atlas = two_cluster_atlas()?;

    // q1 sits on A0 and q2 on B0; g9 is not in the atlas
    let counts = csc_from_triplets(&[(0, 0, 1.0), (1, 1, 1.0)], 3, 2)?;
    let query = QueryData::new(
        counts,
        vec!["g1".into(), "g2".into(), "g9".into()],
        vec!["q1".into(), "q2".into()],
        CellMetadata::default(),
    )?;

    for metric in [MetricKind::Mahalanobis, MetricKind::NeighbourDistance] {
        let annotated = pipeline(atlas.clone(), metric).run(&query, &ProjectionArgs::default())?;

        let a = &annotated.annotations[0];
        assert_eq!(a.cell_type.as_ref(), "A");
        assert_abs_diff_eq!(a.cell_type_prob, 1.0);
        assert_eq!(a.cell_type_broad.as_ref(), "Alpha");
        assert_eq!(a.cycle_phase.as_ref(), "G1");
        assert_abs_diff_eq!(a.pseudotime, 0.0, epsilon = 1e-6);
        assert_eq!(annotated.scored.qc_status(0), QcStatus::Pass);
        assert_eq!(annotated.final_cell_type(0), Some("A"));

        let b = &annotated.annotations[1];
        assert_eq!(b.cell_type.as_ref(), "B");
        // no broad label for B
        assert_eq!(b.cell_type_broad.as_ref(), "B");
        assert_abs_diff_eq!(b.pseudotime, 1.0, epsilon = 1e-6);

        // the projected UMAP stays inside the A patch
        assert!(annotated.umap[(0, 0)] >= 0.0 && annotated.umap[(0, 0)] <= 0.4 + 1e-4);
    }
    Ok(())
}

#[test]
fn pseudotime_is_mixed_only_between_clusters() -> anyhow::Result<()> {
    let atlas = two_cluster_atlas()?;
    let index = atlas.umap_index();

    let pseudotime_at = |x: f32, y: f32| -> anyhow::Result<f32> {
        let nn = index.search_by_query_data(&[x, y], 100)?;
        let times = nn
            .indices
            .iter()
            .map(|&i| atlas.pseudotime[i])
            .collect::<Vec<_>>();
        Ok(weighted_pseudotime(&nn.distances, &times).unwrap())
    };

    assert_eq!(pseudotime_at(0.0, 0.0)?, 0.0);
    // on top of a B cell
    let (x, y) = (atlas.umap[(0, 60)], atlas.umap[(1, 60)]);
    assert_eq!(pseudotime_at(x, y)?, 1.0);

    let mid = pseudotime_at(5.0, 0.2)?;
    assert!(mid > 0.0 && mid < 1.0);
    let near_a = pseudotime_at(3.0, 0.2)?;
    assert!(near_a > 0.0 && near_a < mid);
    Ok(())
}

#[test]
fn harmonization_removes_donor_shift() -> anyhow::Result<()> {
    let sim = simulate_atlas_and_query(&SimArgs {
        cell_types: 3,
        cells_per_type: 60,
        genes: 150,
        dim: 8,
        query_donors: 2,
        query_cells_per_donor: 60,
        donor_effect: 0.5,
        ..Default::default()
    })?;

    let atlas = ReferenceAtlas::from_bundle(sim.atlas, SearchMode::Exact)?;
    let levels = atlas.cell_type_levels().to_vec();

    // reference mean embedding of each type
    let mut type_means = Mat::zeros(atlas.dim(), levels.len());
    let mut type_size = vec![0.0_f32; levels.len()];
    for (i, ct) in atlas.cell_types.iter().enumerate() {
        let t = levels.iter().position(|x| x == ct).unwrap();
        let mut col = type_means.column_mut(t);
        col += atlas.embedding.column(i);
        type_size[t] += 1.0;
    }
    for (t, mut col) in type_means.column_iter_mut().enumerate() {
        col /= type_size[t];
    }

    let mean_distance = |zz: &Mat| -> f32 {
        let tot: f32 = sim
            .query_cell_types
            .iter()
            .enumerate()
            .map(|(j, ct)| {
                let t = levels.iter().position(|x| x == ct).unwrap();
                (zz.column(j) - type_means.column(t)).norm()
            })
            .sum();
        tot / zz.ncols() as f32
    };

    let before = normalize_and_project(&sim.query, &atlas, 50)?;
    let args = HarmonizeArgs {
        batch_key: Some("donor".into()),
        ..Default::default()
    };
    let after = harmonize_query(&sim.query, &atlas, &args)?;

    let (d0, d1) = (mean_distance(&before), mean_distance(&after.embedding));
    assert!(d1 < d0, "corrected {} vs uncorrected {}", d1, d0);
    assert_eq!(after.soft_clusters.nrows(), atlas.num_clusters());
    Ok(())
}

#[test]
fn simulated_query_is_annotated_and_masked() -> anyhow::Result<()> {
    let sim = simulate_atlas_and_query(&SimArgs {
        cell_types: 4,
        cells_per_type: 50,
        genes: 120,
        dim: 8,
        query_donors: 3,
        query_cells_per_donor: 40,
        ..Default::default()
    })?;
    let atlas = Arc::new(ReferenceAtlas::from_bundle(sim.atlas, SearchMode::Exact)?);

    let args = ProjectionArgs {
        harmonize: HarmonizeArgs {
            batch_key: Some("donor".into()),
            ..Default::default()
        },
        qc: MappingQcArgs {
            mad_threshold: 1.0,
            by_donor: true,
            ..Default::default()
        },
        label: LabelTransferArgs {
            knn: 10,
            ..Default::default()
        },
        ..Default::default()
    };

    let annotated = pipeline(atlas.clone(), MetricKind::Mahalanobis).run(&sim.query, &args)?;
    let nn = annotated.num_cells();
    assert_eq!(nn, 120);

    let correct = (0..nn)
        .filter(|&j| annotated.annotations[j].cell_type == sim.query_cell_types[j])
        .count();
    assert!(correct as f32 / nn as f32 > 0.9, "{} of {} correct", correct, nn);

    let nfail = (0..nn).filter(|&j| !annotated.is_pass(j)).count();
    assert!(nfail > 0 && nfail < nn);

    for j in 0..nn {
        let pass = annotated.is_pass(j);
        assert_eq!(annotated.final_cell_type(j).is_some(), pass);
        assert_eq!(annotated.final_cell_type_broad(j).is_some(), pass);
        assert_eq!(annotated.final_cycle_phase(j).is_some(), pass);
        assert_eq!(annotated.final_pseudotime(j).is_some(), pass);
        let p = annotated.annotations[j].pseudotime;
        assert!((0.0..=1.0).contains(&p));
    }

    // composition over the final labels
    let records = composition_records(&annotated);
    let comp_args = CompositionArgs {
        categories: atlas.cell_type_levels().to_vec(),
        ..Default::default()
    };
    let table = aggregate_composition(&records, &comp_args)?;
    assert_eq!(table.donors.len(), 3);
    assert!(!table.categories.iter().any(|c| c.as_ref() == UNASSIGNED));

    for (d, donor) in table.donors.iter().enumerate() {
        let npass = (0..nn)
            .filter(|&j| annotated.scored.donors[j] == *donor && annotated.is_pass(j))
            .count();
        assert_eq!(table.donor_total(d), npass);
    }
    for row in table.proportions() {
        assert_abs_diff_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
    }

    let with_failed = aggregate_composition(
        &records,
        &CompositionArgs {
            include_failed: true,
            ..comp_args
        },
    )?;
    assert_eq!(with_failed.categories.last().map(|c| c.as_ref()), Some(UNASSIGNED));
    let total: usize = (0..with_failed.donors.len()).map(|d| with_failed.donor_total(d)).sum();
    assert_eq!(total, nn);
    Ok(())
}

#[test]
fn malformed_atlas_is_rejected() {
    let mut bundle = two_cluster_bundle();
    bundle.gene_sds.pop();
    assert!(ReferenceAtlas::from_bundle(bundle, SearchMode::Exact).is_err());

    let mut bundle = two_cluster_bundle();
    bundle.cells[1].id = bundle.cells[0].id.clone();
    assert!(ReferenceAtlas::from_bundle(bundle, SearchMode::Exact).is_err());

    let mut bundle = two_cluster_bundle();
    bundle.cells[3].embedding.push(0.0);
    assert!(ReferenceAtlas::from_bundle(bundle, SearchMode::Exact).is_err());

    let mut bundle = two_cluster_bundle();
    bundle.cells.clear();
    assert!(ReferenceAtlas::from_bundle(bundle, SearchMode::Exact).is_err());

    let mut bundle = two_cluster_bundle();
    bundle.lambda = 0.0;
    assert!(ReferenceAtlas::from_bundle(bundle, SearchMode::Exact).is_err());
}

#[test]
fn query_without_shared_genes_or_neighbours_is_rejected() -> anyhow::Result<()> {
    let atlas = two_cluster_atlas()?;
    let counts = csc_from_triplets(&[(0, 0, 1.0)], 1, 1)?;
    let query = QueryData::new(
        counts,
        vec!["unknown".into()],
        vec!["q1".into()],
        CellMetadata::default(),
    )?;
    assert!(pipeline(atlas.clone(), MetricKind::Mahalanobis)
        .run(&query, &ProjectionArgs::default())
        .is_err());

    let counts = csc_from_triplets(&[(0, 0, 1.0)], 1, 1)?;
    let query = QueryData::new(counts, vec!["g1".into()], vec!["q1".into()], CellMetadata::default())?;
    let args = ProjectionArgs {
        label: LabelTransferArgs {
            knn: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    assert!(pipeline(atlas.clone(), MetricKind::Mahalanobis).run(&query, &args).is_err());

    let args = ProjectionArgs {
        harmonize: HarmonizeArgs {
            batch_key: Some("donor".into()),
            ..Default::default()
        },
        ..Default::default()
    };
    assert!(pipeline(atlas, MetricKind::Mahalanobis).run(&query, &args).is_err());
    Ok(())
}

#[test]
fn atlas_bundle_survives_gzip_json() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("atlas.json.gz");
    let file = file.to_str().unwrap();

    two_cluster_bundle().save(file)?;
    let atlas = ReferenceAtlas::load(file, SearchMode::default())?;
    assert_eq!(atlas.num_cells(), 100);
    assert_eq!(atlas.cell_type_levels().len(), 2);
    assert_eq!(atlas.broad_label("A").as_ref(), "Alpha");
    assert_eq!(atlas.gene_position("g3"), Some(2));
    Ok(())
}

#[test]
fn annotation_table_feeds_composition() -> anyhow::Result<()> {
    use atlas_map::output::*;
    use matrix_util::common_io::write_lines;
    use matrix_util::mtx_io::write_mtx_triplets;

    let dir = tempfile::tempdir()?;
    let path = |name: &str| dir.path().join(name).to_str().unwrap().to_string();

    // three A-like cells of donor d1 and one B-like cell of donor d2
    let triplets = vec![
        (0, 0, 1.0),
        (0, 1, 3.0),
        (1, 1, 1.0),
        (0, 2, 4.0),
        (1, 2, 1.0),
        (1, 3, 1.0),
    ];
    write_mtx_triplets(&triplets, 2, 4, &path("q.mtx.gz"))?;
    write_lines(&["g1".into(), "g2".into()], &path("q.genes"))?;
    let cells: Vec<Box<str>> = vec!["c1".into(), "c2".into(), "c3".into(), "c4".into()];
    write_lines(&cells, &path("q.cells"))?;
    write_lines(
        &[
            "cell\tdonor".into(),
            "c1\td1".into(),
            "c2\td1".into(),
            "c3\td1".into(),
            "c4\td2".into(),
        ],
        &path("q.meta.tsv"),
    )?;

    let query = QueryData::from_files(
        &path("q.mtx.gz"),
        &path("q.genes"),
        &path("q.cells"),
        Some(&path("q.meta.tsv")),
    )?;
    assert_eq!(query.metadata.column("donor")?[3].as_ref(), "d2");

    let args = ProjectionArgs {
        donor_key: Some("donor".into()),
        qc: MappingQcArgs {
            mad_threshold: 1e3,
            ..Default::default()
        },
        ..Default::default()
    };
    let annotated = pipeline(two_cluster_atlas()?, MetricKind::Mahalanobis).run(&query, &args)?;

    let table_file = path("annot.tsv.gz");
    write_annotation_table(&table_file, &annotated, None)?;

    let records =
        read_composition_records(&table_file, CELL_TYPE_COLUMN, DONOR_COLUMN, CELL_TYPE_PROB_COLUMN)?;
    assert_eq!(records, composition_records(&annotated));

    let table = aggregate_composition(&records, &CompositionArgs::default())?;
    let expected: Vec<Box<str>> = vec!["d1".into(), "d2".into()];
    assert_eq!(table.donors, expected);
    let expected: Vec<Box<str>> = vec!["A".into(), "B".into()];
    assert_eq!(table.categories, expected);
    assert_eq!(table.counts, vec![vec![3, 0], vec![0, 1]]);
    Ok(())
}
