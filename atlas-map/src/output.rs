//! Annotation, embedding and composition tables on disk.

use crate::common::*;
use crate::composition::{CompositionRecord, CompositionShape, CompositionTable};
use crate::gene_set_score::GeneSetScores;
use crate::label_transfer::AnnotatedQuery;

use matrix_util::common_io::*;
use matrix_util::parquet::{write_parquet_table, TableColumn};

pub const CELL_COLUMN: &str = "cell";
pub const DONOR_COLUMN: &str = "donor";
pub const QC_COLUMN: &str = "mapping_qc";
pub const CELL_TYPE_COLUMN: &str = "predicted_CellType";
pub const CELL_TYPE_PROB_COLUMN: &str = "predicted_CellType_prob";

fn str_column<'a>(values: impl Iterator<Item = Option<&'a str>>) -> TableColumn {
    TableColumn::Str(values.map(|x| x.map(|s| s.into())).collect())
}

fn float_column(values: impl Iterator<Item = Option<f32>>) -> TableColumn {
    TableColumn::Float(values.collect())
}

/// Column names and values of the per-cell annotation table
pub fn annotation_columns(
    annotated: &AnnotatedQuery,
    gene_set_scores: Option<&GeneSetScores>,
) -> anyhow::Result<(Vec<Box<str>>, Vec<TableColumn>)> {
    let nn = annotated.num_cells();
    let ann = &annotated.annotations;
    let scored = &annotated.scored;
    let cells = 0..nn;

    let mut names: Vec<Box<str>> = vec![];
    let mut columns = vec![];
    let mut push = |name: &str, col: TableColumn| {
        names.push(name.into());
        columns.push(col);
    };

    push(
        CELL_COLUMN,
        str_column(annotated.cells().iter().map(|c| Some(c.as_ref()))),
    );
    push(
        DONOR_COLUMN,
        str_column(scored.donors.iter().map(|d| Some(d.as_ref()))),
    );
    push(
        "mapping_error",
        float_column(scored.mapping_error.iter().map(|&s| Some(s))),
    );
    let qc = scored
        .qc
        .status
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
    push(QC_COLUMN, str_column(qc.iter().map(|s| Some(s.as_str()))));

    push(
        "initial_predicted_CellType",
        str_column(ann.iter().map(|a| Some(a.cell_type.as_ref()))),
    );
    push(
        CELL_TYPE_COLUMN,
        str_column(cells.clone().map(|j| annotated.final_cell_type(j))),
    );
    push(
        CELL_TYPE_PROB_COLUMN,
        float_column(ann.iter().map(|a| Some(a.cell_type_prob))),
    );
    push(
        "initial_predicted_CellType_Broad",
        str_column(ann.iter().map(|a| Some(a.cell_type_broad.as_ref()))),
    );
    push(
        "predicted_CellType_Broad",
        str_column(cells.clone().map(|j| annotated.final_cell_type_broad(j))),
    );
    push(
        "initial_predicted_CyclePhase",
        str_column(ann.iter().map(|a| Some(a.cycle_phase.as_ref()))),
    );
    push(
        "predicted_CyclePhase",
        str_column(cells.clone().map(|j| annotated.final_cycle_phase(j))),
    );
    push(
        "predicted_CyclePhase_prob",
        float_column(ann.iter().map(|a| Some(a.cycle_phase_prob))),
    );
    push(
        "initial_predicted_Pseudotime",
        float_column(ann.iter().map(|a| Some(a.pseudotime))),
    );
    push(
        "predicted_Pseudotime",
        float_column(cells.clone().map(|j| annotated.final_pseudotime(j))),
    );
    push(
        "umap_1",
        float_column(annotated.umap.row(0).iter().map(|&x| Some(x))),
    );
    push(
        "umap_2",
        float_column(annotated.umap.row(1).iter().map(|&x| Some(x))),
    );

    if let Some(gs) = gene_set_scores {
        if gs.scores.nrows() != nn {
            return Err(anyhow::anyhow!(
                "{} gene-set score rows for {} cells",
                gs.scores.nrows(),
                nn
            ));
        }
        for (s, name) in gs.set_names.iter().enumerate() {
            push(
                name,
                float_column(gs.scores.column(s).iter().map(|&x| Some(x))),
            );
        }
    }

    Ok((names, columns))
}

fn cell_text(column: &TableColumn, i: usize) -> String {
    match column {
        TableColumn::Str(v) => v[i].as_deref().unwrap_or(NA).to_string(),
        TableColumn::Float(v) => v[i].map(|x| x.to_string()).unwrap_or_else(|| NA.into()),
    }
}

/// Write a table as parquet (`.parquet`) or delimited text (`NA` for
/// nulls) by the file extension
pub fn write_table(file: &str, names: &[Box<str>], columns: &[TableColumn]) -> anyhow::Result<()> {
    mkdir(file)?;

    if file_ext(file).is_ok_and(|ext| ext.as_ref() == "parquet") {
        write_parquet_table(file, names, columns)?;
    } else {
        let delim = detect_delimiter(file);
        let nrows = columns.first().map(|c| c.len()).unwrap_or(0);
        let mut lines: Vec<Box<str>> = Vec::with_capacity(nrows + 1);
        lines.push(names.join(delim).into_boxed_str());
        for i in 0..nrows {
            let row = columns
                .iter()
                .map(|c| cell_text(c, i))
                .collect::<Vec<_>>()
                .join(delim);
            lines.push(row.into_boxed_str());
        }
        write_lines(&lines, file)?;
    }

    info!("wrote {}", file);
    Ok(())
}

pub fn write_annotation_table(
    file: &str,
    annotated: &AnnotatedQuery,
    gene_set_scores: Option<&GeneSetScores>,
) -> anyhow::Result<()> {
    let (names, columns) = annotation_columns(annotated, gene_set_scores)?;
    write_table(file, &names, &columns)
}

/// cells x `dim_1..dim_d`
pub fn write_embedding(file: &str, cells: &[Box<str>], embedding: &Mat) -> anyhow::Result<()> {
    let mut names: Vec<Box<str>> = vec![CELL_COLUMN.into()];
    let mut columns = vec![str_column(cells.iter().map(|c| Some(c.as_ref())))];
    for (k, row) in embedding.row_iter().enumerate() {
        names.push(format!("dim_{}", k + 1).into_boxed_str());
        columns.push(float_column(row.iter().map(|&x| Some(x))));
    }
    write_table(file, &names, &columns)
}

/// cells x gene sets
pub fn write_gene_set_scores(
    file: &str,
    cells: &[Box<str>],
    scores: &GeneSetScores,
) -> anyhow::Result<()> {
    let mut names: Vec<Box<str>> = vec![CELL_COLUMN.into()];
    let mut columns = vec![str_column(cells.iter().map(|c| Some(c.as_ref())))];
    for (s, name) in scores.set_names.iter().enumerate() {
        names.push(name.clone());
        columns.push(float_column(scores.scores.column(s).iter().map(|&x| Some(x))));
    }
    write_table(file, &names, &columns)
}

pub fn write_composition(
    file: &str,
    table: &CompositionTable,
    shape: CompositionShape,
) -> anyhow::Result<()> {
    mkdir(file)?;
    write_lines(&table.to_lines(shape), file)?;
    info!("wrote {}", file);
    Ok(())
}

fn nullable(x: &str) -> Option<&str> {
    if x == NA || x.is_empty() {
        None
    } else {
        Some(x)
    }
}

/// The confidence column written next to a label column
/// (`predicted_CellType` -> `predicted_CellType_prob`)
pub fn confidence_column_for(label_column: &str) -> Box<str> {
    format!("{}_prob", label_column).into_boxed_str()
}

/// Composition records from a delimited annotation table
///
/// * `label_column` - label to aggregate (`NA` is null)
/// * `donor_column` - donor of each cell
/// * `confidence_column` - label confidence; optional in the table
pub fn read_composition_records(
    file: &str,
    label_column: &str,
    donor_column: &str,
    confidence_column: &str,
) -> anyhow::Result<Vec<CompositionRecord>> {
    let ReadLinesOut { lines, header } =
        read_lines_of_words_delim(file, detect_delimiter(file), 0)?;

    let position = |name: &str| header.iter().position(|h| h.as_ref() == name);
    let required = |name: &str| {
        position(name).ok_or_else(|| anyhow::anyhow!("{}: no column '{}'", file, name))
    };

    let label_pos = required(label_column)?;
    let donor_pos = required(donor_column)?;
    let qc_pos = required(QC_COLUMN)?;
    let conf_pos = position(confidence_column);

    lines
        .iter()
        .enumerate()
        .map(|(i, words)| -> anyhow::Result<CompositionRecord> {
            if words.len() != header.len() {
                return Err(anyhow::anyhow!(
                    "{}: row {} has {} fields, header has {}",
                    file,
                    i + 1,
                    words.len(),
                    header.len()
                ));
            }
            let confidence = match conf_pos.and_then(|c| nullable(&words[c])) {
                Some(x) => Some(x.parse::<f32>().map_err(|_| {
                    anyhow::anyhow!("{}: row {}: invalid confidence '{}'", file, i + 1, x)
                })?),
                None => None,
            };
            Ok(CompositionRecord {
                donor: words[donor_pos].clone(),
                label: nullable(&words[label_pos]).map(|x| x.into()),
                qc: words[qc_pos].parse()?,
                confidence,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nulls_are_written_as_na() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("t.tsv.gz");
        let file = file.to_str().unwrap();
        let names: Vec<Box<str>> = vec!["cell".into(), "x".into()];
        let columns = vec![
            TableColumn::Str(vec![Some("c1".into()), None]),
            TableColumn::Float(vec![None, Some(0.5)]),
        ];
        write_table(file, &names, &columns)?;
        let lines = read_lines(file)?;
        assert_eq!(lines[0].as_ref(), "cell\tx");
        assert_eq!(lines[1].as_ref(), "c1\tNA");
        assert_eq!(lines[2].as_ref(), "NA\t0.5");
        Ok(())
    }

    #[test]
    fn read_records_from_annotation_table() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("ann.tsv");
        let file = file.to_str().unwrap();
        write_lines(
            &[
                "cell\tdonor\tmapping_qc\tpredicted_CellType\tpredicted_CellType_prob".into(),
                "c1\td1\tPass\tHSC\t0.9".into(),
                "c2\td1\tFail\tNA\t0.4".into(),
            ],
            file,
        )?;
        let recs = read_composition_records(file, CELL_TYPE_COLUMN, DONOR_COLUMN, CELL_TYPE_PROB_COLUMN)?;
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].label.as_deref(), Some("HSC"));
        assert_eq!(recs[1].label, None);
        assert_eq!(recs[1].qc, QcStatus::Fail);
        assert_eq!(recs[1].confidence, Some(0.4));

        assert!(read_composition_records(file, "nope", DONOR_COLUMN, CELL_TYPE_PROB_COLUMN).is_err());
        Ok(())
    }

    #[test]
    fn confidence_follows_the_label_column() -> anyhow::Result<()> {
        assert_eq!(confidence_column_for(CELL_TYPE_COLUMN).as_ref(), CELL_TYPE_PROB_COLUMN);

        let dir = tempfile::tempdir()?;
        let file = dir.path().join("ann.tsv");
        let file = file.to_str().unwrap();
        write_lines(
            &[
                "cell\tdonor\tmapping_qc\tpredicted_CellType_prob\tpredicted_CyclePhase\tpredicted_CyclePhase_prob".into(),
                "c1\td1\tPass\t0.9\tS\t0.6".into(),
            ],
            file,
        )?;
        let label = "predicted_CyclePhase";
        let recs = read_composition_records(file, label, DONOR_COLUMN, &confidence_column_for(label))?;
        assert_eq!(recs[0].label.as_deref(), Some("S"));
        assert_eq!(recs[0].confidence, Some(0.6));
        Ok(())
    }
}
