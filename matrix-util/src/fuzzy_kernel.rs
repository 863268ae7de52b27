//! Kernel weights on k-nearest-neighbour distances.

/// Adaptive-bandwidth membership weights of one point's neighbours.
///
/// Follows UMAP's local fuzzy simplicial set (McInnes et al. 2018):
/// 1. rho = distance to the nearest neighbour (local connectivity)
/// 2. sigma via binary search: sum_j exp(-(d_j - rho)/sigma) = log2(k)
/// 3. w_j = exp(-max(0, d_j - rho) / sigma)
///
/// Returns weights parallel to `distances`, all in (0, 1]; the nearest
/// neighbour always gets 1.
pub fn fuzzy_membership_weights(distances: &[f32]) -> Vec<f32> {
    if distances.is_empty() {
        return Vec::new();
    }

    let rho = distances.iter().cloned().fold(f32::INFINITY, f32::min);
    let target = (distances.len() as f32).log2();
    let sigma = smooth_knn_sigma(distances, rho, target);

    distances
        .iter()
        .map(|&d| directed_umap_weight(d, rho, sigma))
        .collect()
}

/// Binary search for per-point sigma (UMAP's smooth_knn_dist).
///
/// Finds sigma such that: sum_j exp(-max(0, d_j - rho) / sigma) = target
pub fn smooth_knn_sigma(dists: &[f32], rho: f32, target: f32) -> f32 {
    const TOLERANCE: f32 = 1e-5;
    const MAX_ITER: usize = 64;

    let mean_dist: f32 = dists.iter().sum::<f32>() / dists.len().max(1) as f32;
    let min_sigma = (1e-3 * mean_dist).max(f32::MIN_POSITIVE);

    let mut lo = 0.0f32;
    let mut hi = f32::INFINITY;
    let mut mid = 1.0f32;

    for _ in 0..MAX_ITER {
        let mut psum = 0.0f32;
        for &d in dists {
            let gap = d - rho;
            if gap > 0.0 {
                psum += (-gap / mid).exp();
            } else {
                psum += 1.0;
            }
        }

        if (psum - target).abs() < TOLERANCE {
            break;
        }

        if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            if hi.is_infinite() {
                mid *= 2.0;
            } else {
                mid = (lo + hi) / 2.0;
            }
        }
    }

    mid.max(min_sigma)
}

/// A single directed UMAP membership weight.
pub fn directed_umap_weight(d: f32, rho: f32, sigma: f32) -> f32 {
    if d.is_infinite() || sigma <= 0.0 {
        return 0.0;
    }
    let gap = d - rho;
    if gap <= 0.0 {
        1.0
    } else {
        (-gap / sigma).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smooth_knn_sigma() {
        let dists = [0.1, 0.2, 0.3, 0.5, 1.0];
        let rho = 0.1;
        let target = (5.0f32).log2();

        let sigma = smooth_knn_sigma(&dists, rho, target);
        assert!(sigma > 0.0, "sigma should be positive");

        let psum: f32 = dists
            .iter()
            .map(|&d| directed_umap_weight(d, rho, sigma))
            .sum();

        assert!(
            (psum - target).abs() < 0.1,
            "psum {:.3} should be close to target {:.3}",
            psum,
            target
        );
    }

    #[test]
    fn test_fuzzy_membership_weights() {
        let w = fuzzy_membership_weights(&[0.5, 0.7, 1.0, 2.0]);
        assert_eq!(w.len(), 4);
        assert_eq!(w[0], 1.0);
        for x in w.windows(2) {
            assert!(x[0] >= x[1]);
        }
        for &x in &w {
            assert!(x > 0.0 && x <= 1.0);
        }
    }

    #[test]
    fn test_coincident_neighbours_all_one() {
        let w = fuzzy_membership_weights(&[0.0, 0.0, 0.0]);
        assert!(w.iter().all(|&x| x == 1.0));
    }
}
