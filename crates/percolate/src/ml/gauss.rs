//! Gauss-Jordan elimination for solution of systems of linear equations
//!
//! Used for the normal equations of the retention time regressions, and for
//! the scatter matrices of the linear discriminant: solving Sw.dot(x) = Sb
//! and then taking the leading eigenvector of x.

use super::matrix::Matrix;

#[derive(Debug)]
pub struct Gauss {
    pub left: Matrix,
    pub right: Matrix,
}

impl Gauss {
    /// Solve `left.dot(x) = right`, returning `None` if `left` is singular
    pub fn solve(left: Matrix, right: Matrix) -> Option<Matrix> {
        assert_eq!(left.rows, left.cols, "left-hand side must be square");
        assert_eq!(left.rows, right.rows);
        let mut g = Gauss { left, right };
        g.echelon();
        g.reduce();
        g.backfill();

        // If `left` is the identity matrix, then `right` contains
        // the solution to the system of equations
        let finite = (0..g.right.rows).all(|i| g.right.row(i).iter().all(|x| x.is_finite()));
        match g.left_solved() && finite {
            true => Some(g.right),
            false => None,
        }
    }

    // Is `left` an identity matrix, or else contains rows of all zeros?
    fn left_solved(&self) -> bool {
        let n = self.left.cols;
        for i in 0..n {
            for j in 0..n {
                let x = self.left[(i, j)];
                if i == j {
                    if x != 1.0 && x != 0.0 {
                        return false;
                    }
                } else if x != 0.0 {
                    return false;
                }
            }
        }
        true
    }

    fn echelon(&mut self) {
        let (m, n) = self.left.shape();
        let mut h = 0;
        let mut k = 0;

        while h < m && k < n {
            // Partial pivoting on the largest magnitude in column k
            let mut pivot = h;
            for i in h + 1..m {
                if self.left[(i, k)].abs() > self.left[(pivot, k)].abs() {
                    pivot = i;
                }
            }
            if self.left[(pivot, k)] == 0.0 {
                k += 1;
                continue;
            }

            if h != pivot {
                self.left.swap_rows(h, pivot);
                self.right.swap_rows(h, pivot);
            }

            // Clear rows below pivot row
            for i in h + 1..m {
                let factor = self.left[(i, k)] / self.left[(h, k)];
                self.left[(i, k)] = 0.0;
                for j in k + 1..n {
                    self.left[(i, j)] -= self.left[(h, j)] * factor;
                }
                for j in 0..self.right.cols {
                    self.right[(i, j)] -= self.right[(h, j)] * factor;
                }
            }
            h += 1;
            k += 1;
        }
    }

    // Reduce left matrix to reduced echelon form - diagonal is all ones
    fn reduce(&mut self) {
        for i in (0..self.left.rows).rev() {
            let lead = (0..self.left.cols).find(|&j| self.left[(i, j)] != 0.0);
            if let Some(j) = lead {
                let x = self.left[(i, j)];
                for k in j..self.left.cols {
                    self.left[(i, k)] /= x;
                }
                for k in 0..self.right.cols {
                    self.right[(i, k)] /= x;
                }
            }
        }
    }

    // Solve the upper triangular matrix
    fn backfill(&mut self) {
        for i in (0..self.left.rows).rev() {
            let lead = (0..self.left.cols).find(|&j| self.left[(i, j)] != 0.0);
            if let Some(j) = lead {
                for k in 0..i {
                    let factor = self.left[(k, j)] / self.left[(i, j)];
                    for h in 0..self.left.cols {
                        self.left[(k, h)] -= self.left[(i, h)] * factor;
                    }
                    for h in 0..self.right.cols {
                        self.right[(k, h)] -= self.right[(i, h)] * factor;
                    }
                }
            }
        }
    }
}

/// Ridge-regularized least squares: solve `(XᵀX + λI) β = Xᵀy`
pub fn least_squares(x: &Matrix, y: &[f64], ridge: f64) -> Option<Vec<f64>> {
    let x_t = x.transpose();
    let mut cov = x_t.dot(x);
    cov.add_diagonal(ridge);
    let b = x_t.dot(&Matrix::col_vector(y.to_vec()));
    Gauss::solve(cov, b).map(Matrix::take)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ml::all_close;

    #[test]
    fn solve_system() {
        // 2x + y - z = 8; -3x - y + 2z = -11; -2x + y + 2z = -3
        #[rustfmt::skip]
        let left = Matrix::new([
            2., 1., -1.,
            -3., -1., 2.,
            -2., 1., 2.
        ], 3, 3);
        let right = Matrix::col_vector(vec![8., -11., -3.]);
        let x = Gauss::solve(left, right).unwrap().take();
        assert!(all_close(&x, &[2., 3., -1.], 1E-10), "{:?}", x);
    }

    #[test]
    fn singular() {
        let left = Matrix::new([1., 2., 2., 4.], 2, 2);
        let right = Matrix::col_vector(vec![1., 1.]);
        assert!(Gauss::solve(left, right).is_none());
    }

    #[test]
    fn regression() {
        // y = 3x - 1
        let x = Matrix::new([0., 1., 1., 1., 2., 1., 3., 1.], 4, 2);
        let beta = least_squares(&x, &[-1., 2., 5., 8.], 0.0).unwrap();
        assert!(all_close(&beta, &[3., -1.], 1E-10), "{:?}", beta);
    }
}
