//! Mixture of common factor analyzers (MCFA) with missing-data support.
//!
//! Every component `k` shares the loading matrix `A` (p × q) and the diagonal
//! noise `Ψ`, and has its own latent mean `ξ_k` and latent covariance `Ω_k`:
//!
//! ```text
//!   x | k  ~  N(A ξ_k,  A Ω_k Aᵀ + Ψ)
//! ```
//!
//! Missing features (NaN) are marginalized by restricting means and
//! covariances to the observed rows and columns.

use std::f64::consts::PI;

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The narrow interface the Mahlke classifier needs from a fitted model.
pub trait MixtureModel: Send + Sync {
    fn n_components(&self) -> usize;
    fn n_factors(&self) -> usize;
    fn n_features(&self) -> usize;

    /// Posterior component probabilities given the observed (finite) features.
    fn responsibility(&self, features: &[f64]) -> Result<Vec<f64>>;

    /// Copy of `features` with missing values replaced by their conditional
    /// expectation under the mixture.
    fn impute(&self, features: &[f64]) -> Result<Vec<f64>>;

    /// Latent factor scores of a complete feature vector.
    fn transform(&self, imputed: &[f64]) -> Result<Vec<f64>>;
}

/// Fitted MCFA parameters as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McfaParams {
    /// Mixing weights, one per component.
    pub weights: Vec<f64>,
    /// Loading matrix, p rows of q values.
    pub loadings: Vec<Vec<f64>>,
    /// Latent means, one q-vector per component.
    pub means: Vec<Vec<f64>>,
    /// Latent covariances, one q × q matrix per component.
    pub covariances: Vec<Vec<Vec<f64>>>,
    /// Diagonal noise variances, p values.
    pub psi: Vec<f64>,
}

pub struct Mcfa {
    weights: Vec<f64>,
    loadings: DMatrix<f64>,
    latent_means: Vec<DVector<f64>>,
    latent_covs: Vec<DMatrix<f64>>,
    /// A ξ_k
    means: Vec<DVector<f64>>,
    /// A Ω_k Aᵀ + Ψ
    covs: Vec<DMatrix<f64>>,
}

fn matrix(rows: &[Vec<f64>], ncols: usize, what: &str) -> Result<DMatrix<f64>> {
    if rows.iter().any(|row| row.len() != ncols) {
        return Err(Error::Model(format!("{what} rows must have {ncols} columns")));
    }
    Ok(DMatrix::from_fn(rows.len(), ncols, |i, j| rows[i][j]))
}

impl Mcfa {
    pub fn new(params: McfaParams) -> Result<Self> {
        let n_components = params.weights.len();
        let p = params.psi.len();
        let q = params.loadings.first().map_or(0, Vec::len);

        if n_components == 0 || p == 0 || q == 0 {
            return Err(Error::Model("empty model".to_string()));
        }
        if params.loadings.len() != p {
            return Err(Error::Model(format!(
                "loadings have {} rows but psi has {p} entries",
                params.loadings.len()
            )));
        }
        if params.means.len() != n_components || params.covariances.len() != n_components {
            return Err(Error::Model(format!(
                "expected {n_components} latent means and covariances"
            )));
        }
        if params.weights.iter().any(|w| !(*w > 0.0)) {
            return Err(Error::Model("mixing weights must be positive".to_string()));
        }
        if params.psi.iter().any(|v| !(*v > 0.0)) {
            return Err(Error::Model("noise variances must be positive".to_string()));
        }

        let total: f64 = params.weights.iter().sum();
        let weights = params.weights.iter().map(|w| w / total).collect();

        let loadings = matrix(&params.loadings, q, "loadings")?;
        let psi = DMatrix::from_diagonal(&DVector::from_vec(params.psi));

        let mut latent_means = Vec::with_capacity(n_components);
        let mut latent_covs = Vec::with_capacity(n_components);
        let mut means = Vec::with_capacity(n_components);
        let mut covs = Vec::with_capacity(n_components);

        for (mean, cov) in params.means.iter().zip(&params.covariances) {
            if mean.len() != q || cov.len() != q {
                return Err(Error::Model(format!("latent parameters must have {q} factors")));
            }
            let xi = DVector::from_column_slice(mean);
            let omega = matrix(cov, q, "latent covariance")?;

            means.push(&loadings * &xi);
            covs.push(&loadings * &omega * loadings.transpose() + &psi);
            latent_means.push(xi);
            latent_covs.push(omega);
        }

        Ok(Mcfa {
            weights,
            loadings,
            latent_means,
            latent_covs,
            means,
            covs,
        })
    }

    fn check_len(&self, features: &[f64]) -> Result<()> {
        if features.len() != self.n_features() {
            return Err(Error::Model(format!(
                "expected {} features, got {}",
                self.n_features(),
                features.len()
            )));
        }
        Ok(())
    }

    fn cholesky(&self, cov: DMatrix<f64>, k: usize) -> Result<Cholesky<f64, Dyn>> {
        Cholesky::new(cov).ok_or_else(|| {
            Error::Model(format!("covariance of component {k} is not positive definite"))
        })
    }

    /// ln π_k + ln N(x_o | μ_k,o, Σ_k,oo) for every component.
    fn log_joint(&self, features: &[f64], observed: &[usize]) -> Result<Vec<f64>> {
        let x = DVector::from_iterator(observed.len(), observed.iter().map(|&i| features[i]));
        let n = observed.len() as f64;

        (0..self.n_components())
            .map(|k| {
                let mu = self.means[k].select_rows(observed);
                let cov = self.covs[k].select_rows(observed).select_columns(observed);
                let chol = self.cholesky(cov, k)?;

                let diff = &x - mu;
                let mahalanobis = diff.dot(&chol.solve(&diff));
                let log_det: f64 = chol.l_dirty().diagonal().iter().map(|d| 2.0 * d.ln()).sum();

                Ok(self.weights[k].ln() - 0.5 * (n * (2.0 * PI).ln() + log_det + mahalanobis))
            })
            .collect()
    }
}

fn observed_indices(features: &[f64]) -> Vec<usize> {
    features
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .map(|(i, _)| i)
        .collect()
}

/// Normalize log-weights into probabilities (log-sum-exp).
fn softmax(log_weights: &[f64]) -> Vec<f64> {
    let max = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp: Vec<f64> = log_weights.iter().map(|l| (l - max).exp()).collect();
    let total: f64 = exp.iter().sum();
    exp.into_iter().map(|e| e / total).collect()
}

impl MixtureModel for Mcfa {
    fn n_components(&self) -> usize {
        self.weights.len()
    }

    fn n_factors(&self) -> usize {
        self.loadings.ncols()
    }

    fn n_features(&self) -> usize {
        self.loadings.nrows()
    }

    fn responsibility(&self, features: &[f64]) -> Result<Vec<f64>> {
        self.check_len(features)?;
        let observed = observed_indices(features);
        if observed.is_empty() {
            return Ok(self.weights.clone());
        }
        Ok(softmax(&self.log_joint(features, &observed)?))
    }

    fn impute(&self, features: &[f64]) -> Result<Vec<f64>> {
        self.check_len(features)?;
        let observed = observed_indices(features);
        let missing: Vec<usize> = (0..features.len())
            .filter(|i| !features[*i].is_finite())
            .collect();
        if missing.is_empty() {
            return Ok(features.to_vec());
        }

        let responsibility = self.responsibility(features)?;
        let x_o = DVector::from_iterator(observed.len(), observed.iter().map(|&i| features[i]));
        let mut expected = DVector::<f64>::zeros(missing.len());

        for k in 0..self.n_components() {
            let mu_m = self.means[k].select_rows(&missing);
            let conditional = if observed.is_empty() {
                mu_m
            } else {
                let mu_o = self.means[k].select_rows(&observed);
                let cov_oo = self.covs[k].select_rows(&observed).select_columns(&observed);
                let cov_mo = self.covs[k].select_rows(&missing).select_columns(&observed);
                let chol = self.cholesky(cov_oo, k)?;
                mu_m + cov_mo * chol.solve(&(&x_o - mu_o))
            };
            expected += conditional * responsibility[k];
        }

        let mut imputed = features.to_vec();
        for (slot, &i) in missing.iter().enumerate() {
            imputed[i] = expected[slot];
        }
        Ok(imputed)
    }

    fn transform(&self, imputed: &[f64]) -> Result<Vec<f64>> {
        self.check_len(imputed)?;
        if imputed.iter().any(|v| !v.is_finite()) {
            return Err(Error::Model("transform needs a complete feature vector".to_string()));
        }

        let responsibility = self.responsibility(imputed)?;
        let x = DVector::from_column_slice(imputed);
        let mut latent = DVector::<f64>::zeros(self.n_factors());

        for k in 0..self.n_components() {
            let chol = self.cholesky(self.covs[k].clone(), k)?;
            let projected = &self.latent_covs[k]
                * self.loadings.transpose()
                * chol.solve(&(&x - &self.means[k]));
            latent += (&self.latent_means[k] + projected) * responsibility[k];
        }
        Ok(latent.iter().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two well separated clusters in 3-D sharing one factor.
    fn two_clusters() -> Mcfa {
        Mcfa::new(McfaParams {
            weights: vec![0.5, 0.5],
            loadings: vec![vec![1.0], vec![1.0], vec![0.5]],
            means: vec![vec![-2.0], vec![2.0]],
            covariances: vec![vec![vec![0.1]], vec![vec![0.1]]],
            psi: vec![0.05, 0.05, 0.05],
        })
        .unwrap()
    }

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn responsibility_picks_nearest_cluster() {
        let model = two_clusters();
        let r = model.responsibility(&[2.0, 2.0, 1.0]).unwrap();
        assert!(r[1] > 0.999);
        assert!(close(r.iter().sum::<f64>(), 1.0, 1e-12));
    }

    #[test]
    fn missing_values_are_marginalized() {
        let model = two_clusters();
        let r = model.responsibility(&[-2.0, f64::NAN, f64::NAN]).unwrap();
        assert!(r[0] > 0.999);

        let prior = model.responsibility(&[f64::NAN; 3]).unwrap();
        assert!(close(prior[0], 0.5, 1e-12));
    }

    #[test]
    fn imputation_follows_the_observed_cluster() {
        let model = two_clusters();
        let imputed = model.impute(&[2.0, f64::NAN, f64::NAN]).unwrap();
        assert_eq!(imputed[0], 2.0);
        assert!(close(imputed[1], 2.0, 0.1));
        assert!(close(imputed[2], 1.0, 0.1));
    }

    #[test]
    fn latent_score_tracks_cluster_mean() {
        let model = two_clusters();
        let z = model.transform(&[2.0, 2.0, 1.0]).unwrap();
        assert_eq!(z.len(), 1);
        assert!(close(z[0], 2.0, 0.1));
        assert!(model.transform(&[2.0, f64::NAN, 1.0]).is_err());
    }

    #[test]
    fn rejects_inconsistent_shapes() {
        let mut params = McfaParams {
            weights: vec![1.0],
            loadings: vec![vec![1.0], vec![1.0]],
            means: vec![vec![0.0]],
            covariances: vec![vec![vec![1.0]]],
            psi: vec![0.1],
        };
        assert!(Mcfa::new(params.clone()).is_err());
        params.psi = vec![0.1, 0.1];
        assert!(Mcfa::new(params.clone()).is_ok());
        params.weights = vec![0.0];
        assert!(Mcfa::new(params).is_err());
    }

    #[test]
    fn wrong_feature_count_is_an_error() {
        let model = two_clusters();
        assert!(model.responsibility(&[1.0, 2.0]).is_err());
    }
}
