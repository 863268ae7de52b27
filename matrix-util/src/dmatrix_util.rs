use crate::traits::*;
pub use nalgebra::DMatrix;

impl MatOps for DMatrix<f32> {
    type Mat = Self;

    fn normalize_columns_inplace(&mut self) {
        for mut xx_j in self.column_iter_mut() {
            let denom = xx_j.norm();
            if denom > 0.0 {
                xx_j /= denom;
            }
        }
    }

    fn normalize_columns(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.normalize_columns_inplace();
        ret
    }

    fn normalize_exp_logits_columns_inplace(&mut self) {
        for mut xx_j in self.column_iter_mut() {
            let max_val = xx_j.max();
            xx_j.apply(|x| *x = (*x - max_val).exp());
            let denom = xx_j.sum();
            if denom > 0.0 {
                xx_j /= denom;
            }
        }
    }
}

impl RowStatOps for DMatrix<f32> {
    type Scalar = f32;

    fn row_means(&self) -> Vec<f32> {
        let nn = self.ncols().max(1) as f32;
        self.row_iter().map(|r| r.sum() / nn).collect()
    }

    fn row_sds(&self) -> Vec<f32> {
        let nn = self.ncols() as f32;
        self.row_iter()
            .map(|r| {
                let mu = r.sum() / nn.max(1.0);
                let ss: f32 = r.iter().map(|&x| (x - mu) * (x - mu)).sum();
                (ss / (nn - 1.0).max(1.0)).sqrt()
            })
            .collect()
    }
}
