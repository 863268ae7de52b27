use fnv::FnvHashMap as HashMap;
use std::hash::Hash;

/// partition membership vector into groups of indexes
/// # Arguments
/// * `membership` - a vector of membership (E.g., donor or batch)
/// # Returns
/// A hashmap: group name -> indexes of the elements, in input order
pub fn partition_by_membership<T>(membership: &[T]) -> HashMap<T, Vec<usize>>
where
    T: Eq + Hash + Clone,
{
    let mut pb_elems: HashMap<T, Vec<usize>> = HashMap::default();
    for (cell, k) in membership.iter().enumerate() {
        pb_elems.entry(k.clone()).or_default().push(cell);
    }
    pb_elems
}

/// Generate minibatch intervals
/// * `ntot` - number of total samples
/// * `batch_size` - the size of each batch (0 means one batch)
pub fn generate_minibatch_intervals(ntot: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let batch_size = if batch_size == 0 { ntot.max(1) } else { batch_size };
    let num_batches = ntot.div_ceil(batch_size);
    (0..num_batches)
        .map(|b| {
            let lb: usize = b * batch_size;
            let ub: usize = ((b + 1) * batch_size).min(ntot);
            (lb, ub)
        })
        .collect::<Vec<_>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minibatch_intervals() {
        assert_eq!(
            generate_minibatch_intervals(10, 3),
            vec![(0, 3), (3, 6), (6, 9), (9, 10)]
        );
        assert_eq!(generate_minibatch_intervals(6, 3), vec![(0, 3), (3, 6)]);
        assert_eq!(generate_minibatch_intervals(5, 0), vec![(0, 5)]);
        assert!(generate_minibatch_intervals(0, 4).is_empty());
    }

    #[test]
    fn test_partition_by_membership() {
        let groups = partition_by_membership(&["a", "b", "a", "c", "a"]);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[&"a"], vec![0, 2, 4]);
        assert_eq!(groups[&"c"], vec![3]);
    }
}
