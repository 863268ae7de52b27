//! Per-donor cell-type composition tables.

use crate::common::*;
use crate::label_transfer::AnnotatedQuery;

use fnv::FnvHashMap as HashMap;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CompositionShape {
    /// one row per donor and category with count and proportion
    Long,
    /// donors x categories counts
    Count,
    /// donors x categories proportions
    #[default]
    Proportion,
}

#[derive(Clone, Debug, Default)]
pub struct CompositionArgs {
    /// drop cells whose label confidence is below this
    pub confidence_cutoff: Option<f32>,
    /// keep QC-failed cells; their null labels count as unassigned
    pub include_failed: bool,
    /// column order; labels not listed here are appended in sorted
    /// order
    pub categories: Vec<Box<str>>,
}

/// What the aggregator needs to know about one cell
#[derive(Clone, Debug, PartialEq)]
pub struct CompositionRecord {
    pub donor: Box<str>,
    /// final label; `None` for QC-failed cells
    pub label: Option<Box<str>>,
    pub qc: QcStatus,
    pub confidence: Option<f32>,
}

/// Records from an annotated query using the final cell type
pub fn composition_records(annotated: &AnnotatedQuery) -> Vec<CompositionRecord> {
    (0..annotated.num_cells())
        .map(|j| CompositionRecord {
            donor: annotated.scored.donors[j].clone(),
            label: annotated.final_cell_type(j).map(|x| x.into()),
            qc: annotated.scored.qc_status(j),
            confidence: Some(annotated.annotations[j].cell_type_prob),
        })
        .collect()
}

/// Dense donors x categories counts
#[derive(Clone, Debug, PartialEq)]
pub struct CompositionTable {
    pub donors: Vec<Box<str>>,
    pub categories: Vec<Box<str>>,
    /// `counts[d][c]`
    pub counts: Vec<Vec<usize>>,
}

impl CompositionTable {
    pub fn donor_total(&self, d: usize) -> usize {
        self.counts[d].iter().sum()
    }

    /// Each row divided by its total; a donor with no counted cells
    /// keeps a row of zeros
    pub fn proportions(&self) -> Vec<Vec<f32>> {
        self.counts
            .iter()
            .map(|row| {
                let tot = row.iter().sum::<usize>();
                row.iter()
                    .map(|&n| if tot > 0 { n as f32 / tot as f32 } else { 0.0 })
                    .collect()
            })
            .collect()
    }

    /// Tab-separated lines with a header
    pub fn to_lines(&self, shape: CompositionShape) -> Vec<Box<str>> {
        let mut lines = vec![];
        match shape {
            CompositionShape::Long => {
                lines.push("donor\tcategory\tcount\tproportion".into());
                let props = self.proportions();
                for (d, donor) in self.donors.iter().enumerate() {
                    for (c, cat) in self.categories.iter().enumerate() {
                        lines.push(
                            format!(
                                "{}\t{}\t{}\t{}",
                                donor, cat, self.counts[d][c], props[d][c]
                            )
                            .into_boxed_str(),
                        );
                    }
                }
            }
            CompositionShape::Count => {
                lines.push(self.wide_header());
                for (d, donor) in self.donors.iter().enumerate() {
                    let row = self.counts[d]
                        .iter()
                        .map(|n| n.to_string())
                        .collect::<Vec<_>>()
                        .join("\t");
                    lines.push(format!("{}\t{}", donor, row).into_boxed_str());
                }
            }
            CompositionShape::Proportion => {
                lines.push(self.wide_header());
                for (donor, props) in self.donors.iter().zip(self.proportions()) {
                    let row = props
                        .iter()
                        .map(|p| p.to_string())
                        .collect::<Vec<_>>()
                        .join("\t");
                    lines.push(format!("{}\t{}", donor, row).into_boxed_str());
                }
            }
        }
        lines
    }

    fn wide_header(&self) -> Box<str> {
        let mut hdr = vec!["donor"];
        hdr.extend(self.categories.iter().map(|c| c.as_ref()));
        hdr.join("\t").into_boxed_str()
    }
}

/// Count cells per donor and category after the QC and confidence
/// filters. Every donor seen in `records` gets a row, even if none of
/// its cells are counted.
pub fn aggregate_composition(
    records: &[CompositionRecord],
    args: &CompositionArgs,
) -> anyhow::Result<CompositionTable> {
    if let Some(cutoff) = args.confidence_cutoff {
        if !cutoff.is_finite() {
            return Err(anyhow::anyhow!("invalid confidence cutoff {}", cutoff));
        }
    }

    let mut donors = records.iter().map(|r| r.donor.clone()).collect::<Vec<_>>();
    donors.sort();
    donors.dedup();

    let mut observed = records
        .iter()
        .filter_map(|r| r.label.clone())
        .collect::<Vec<_>>();
    observed.sort();
    observed.dedup();

    let mut categories = args.categories.clone();
    let extra = observed
        .into_iter()
        .filter(|x| !categories.contains(x))
        .collect::<Vec<_>>();
    if !categories.is_empty() && !extra.is_empty() {
        warn!(
            "{} labels outside the category list are appended: {}",
            extra.len(),
            extra.join(", ")
        );
    }
    categories.extend(extra);

    let donor_index: HashMap<&str, usize> = donors
        .iter()
        .enumerate()
        .map(|(d, x)| (x.as_ref(), d))
        .collect();

    let mut category_index: HashMap<Box<str>, usize> = HashMap::default();
    for (c, x) in categories.iter().enumerate() {
        if category_index.insert(x.clone(), c).is_some() {
            return Err(anyhow::anyhow!("duplicated category {}", x));
        }
    }

    let ncat = categories.len();
    let mut counts = vec![vec![0_usize; ncat]; donors.len()];
    let mut unassigned = vec![0_usize; donors.len()];
    // an `unassigned` category already in the list takes the null labels
    let unassigned_column = category_index.get(UNASSIGNED).copied();

    for r in records {
        if !r.qc.is_pass() && !args.include_failed {
            continue;
        }
        if let Some(cutoff) = args.confidence_cutoff {
            match r.confidence {
                Some(p) if p >= cutoff => {}
                _ => continue,
            }
        }

        let d = donor_index[r.donor.as_ref()];
        match (r.label.as_ref(), unassigned_column) {
            (Some(label), _) => counts[d][category_index[label]] += 1,
            (None, Some(c)) => counts[d][c] += 1,
            (None, None) => unassigned[d] += 1,
        }
    }

    if unassigned.iter().any(|&n| n > 0) {
        categories.push(UNASSIGNED.into());
        for (row, n) in counts.iter_mut().zip(unassigned) {
            row.push(n);
        }
    }

    Ok(CompositionTable {
        donors,
        categories,
        counts,
    })
}
