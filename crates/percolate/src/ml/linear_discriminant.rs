//! Fisher's linear discriminant, as an alternative to the SVM
//!
//! The generalized eigenvalue problem for the scatter matrices Sb and Sw is
//! solved as the standard eigenvalue problem of inv(Sw).dot(Sb) via
//! Gauss-Jordan elimination and the power method.

use super::gauss::Gauss;
use super::matrix::Matrix;
use super::{Classifier, TrainingSet};
use crate::scoring::Weights;
use crate::Error;

#[derive(Copy, Clone, Debug, Default)]
pub struct LinearDiscriminant;

impl LinearDiscriminant {
    /// Leading discriminant direction, oriented so that positives score
    /// higher than negatives. Also returns the projected class means
    /// (negative, positive).
    pub fn train(features: &Matrix, positive: &[bool]) -> Option<(Vec<f64>, [f64; 2])> {
        assert_eq!(features.rows, positive.len());

        // Calculate class means, and overall mean
        let x_bar = features.mean();
        let mut scatter_within = Matrix::zeros(features.cols, features.cols);
        let mut scatter_between = Matrix::zeros(features.cols, features.cols);

        let mut class_means = Vec::new();

        for class in [false, true] {
            let rows = (0..features.rows)
                .filter(|&row| positive[row] == class)
                .map(|row| features.row(row));
            let mut class_data = Matrix::from_rows(rows, features.cols);
            if class_data.rows == 0 {
                log::trace!("- linear discriminant requires examples of both classes");
                return None;
            }
            let class_mean = class_data.mean();

            for row in 0..class_data.rows {
                for col in 0..class_data.cols {
                    class_data[(row, col)] -= class_mean[col];
                }
            }

            let cov = class_data.transpose().dot(&class_data);
            scatter_within += cov;

            let diff = Matrix::col_vector(
                class_mean
                    .iter()
                    .zip(x_bar.iter())
                    .map(|(x, y)| x - y)
                    .collect::<Vec<_>>(),
            );

            scatter_between += diff.dot(&diff.transpose());
            class_means.extend(class_mean);
        }

        // Use overall mean as the initial vector for power method
        let mut evec =
            Gauss::solve(scatter_within, scatter_between).map(|mat| mat.power_method(&x_bar))?;

        // Power method can return the eigenvector with signs flipped
        let class_means = Matrix::new(class_means, 2, features.cols);
        let mut coef = class_means.dotv(&evec);
        if coef[1] < coef[0] {
            evec.iter_mut().for_each(|c| *c *= -1.0);
            coef.iter_mut().for_each(|c| *c *= -1.0);
        }

        log::trace!("- linear model fit with eigenvector: {:?}", evec);
        Some((evec, [coef[0], coef[1]]))
    }
}

impl Classifier for LinearDiscriminant {
    fn fit(&self, data: &TrainingSet, _cpos: f64, _cneg: f64) -> Result<Weights, Error> {
        let positive = data.labels.iter().map(|&y| y > 0.0).collect::<Vec<_>>();
        let (evec, [neg, pos]) = Self::train(&data.features, &positive).ok_or_else(|| {
            Error::ClassifierConvergence("within-class scatter matrix is singular".into())
        })?;

        // Decision boundary halfway between the projected class means
        let weights = Weights::new(evec, -0.5 * (neg + pos));
        match weights.is_finite() {
            true => Ok(weights),
            false => Err(Error::ClassifierConvergence(
                "linear discriminant includes non-finite weights".into(),
            )),
        }
    }

    fn uses_costs(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ml::*;

    #[test]
    fn power_method() {
        let a = Matrix::new([1., 2., 3., 4.], 2, 2);
        let eigenvector = [0.4159736, 0.90937671];
        assert!(all_close(
            &a.power_method(&[0.54, 0.34]),
            &eigenvector,
            1E-5
        ));
    }

    #[test]
    fn linear_discriminant() {
        #[rustfmt::skip]
        let feats = Matrix::new(
            [
                5., 4., 3., 2.,
                4., 5., 4., 3.,
                6., 3., 4., 5.,
                1., 0., 2., 9.,
                5., 4., 4., 3.,
                2., 1., 1., 9.5,
                1., 0., 2., 8.,
                3., 2., -2., 10.,
            ],
            8,
            4,
        );
        let labels = vec![1., 1., 1., -1., 1., -1., -1., -1.];
        let data = TrainingSet::new(feats.clone(), labels.clone());

        let weights = LinearDiscriminant.fit(&data, 1.0, 1.0).unwrap();

        let mut scores = feats.dotv(weights.features());
        let n = norm(&scores);
        scores = scores.into_iter().map(|s| s / n).collect();
        let expected = [
            0.49706043,
            0.48920177,
            0.48920177,
            -0.07209359,
            0.51204672,
            -0.02849527,
            -0.04924864,
            -0.06055943,
        ];
        assert!(all_close(&scores, &expected, 1E-6), "{:?}", scores);

        // The bias separates the two classes
        for (row, y) in labels.iter().enumerate() {
            let s = crate::scoring::score(&weights, feats.row(row));
            assert!(s * y > 0.0, "row {} scored {}", row, s);
        }
    }

    #[test]
    fn single_class_fails() {
        let feats = Matrix::new([1., 2., 3., 4.], 2, 2);
        let data = TrainingSet::new(feats, vec![1., 1.]);
        assert!(matches!(
            LinearDiscriminant.fit(&data, 1.0, 1.0),
            Err(Error::ClassifierConvergence(_))
        ));
    }
}
