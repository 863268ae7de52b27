/// Column-wise normalization
pub trait MatOps {
    type Mat;

    /// `x[,j] / norm(x[,j])`, zero columns stay zero
    fn normalize_columns_inplace(&mut self);
    fn normalize_columns(&self) -> Self::Mat;

    /// treat each column as logits and turn it into a probability
    /// vector via log-sum-exp
    fn normalize_exp_logits_columns_inplace(&mut self);
}

/// Per-row summary statistics
pub trait RowStatOps {
    type Scalar;

    fn row_means(&self) -> Vec<Self::Scalar>;

    /// sample standard deviation (denominator `n - 1`)
    fn row_sds(&self) -> Vec<Self::Scalar>;
}
