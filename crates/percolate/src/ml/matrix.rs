use super::norm;
use rayon::prelude::*;
use std::fmt::{self, Debug};
use std::ops::{AddAssign, Index, IndexMut};

/// Dense, row-major matrix
#[derive(Clone, PartialEq)]
pub struct Matrix {
    data: Vec<f64>,
    pub rows: usize,
    pub cols: usize,
}

impl Matrix {
    /// Create a new `Matrix`
    ///
    /// # Panics
    ///
    /// * Panics if `data` does not have len == rows * cols
    pub fn new<T: Into<Vec<f64>>>(t: T, rows: usize, cols: usize) -> Matrix {
        let data = t.into();
        assert_eq!(
            data.len(),
            rows * cols,
            "data passed to Matrix::new() does not have shape ({}, {})",
            rows,
            cols
        );
        Matrix { data, rows, cols }
    }

    /// Stack equal-length rows
    pub fn from_rows<'a, I>(rows: I, cols: usize) -> Matrix
    where
        I: IntoIterator<Item = &'a [f64]>,
    {
        let mut data = Vec::new();
        let mut n = 0;
        for row in rows {
            assert_eq!(row.len(), cols, "row {} has length {}", n, row.len());
            data.extend_from_slice(row);
            n += 1;
        }
        Matrix {
            data,
            rows: n,
            cols,
        }
    }

    pub fn zeros(rows: usize, cols: usize) -> Matrix {
        Matrix {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    pub fn col_vector(data: Vec<f64>) -> Matrix {
        let rows = data.len();
        Matrix {
            data,
            rows,
            cols: 1,
        }
    }

    pub const fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn col(&self, col: usize) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().skip(col).step_by(self.cols).copied()
    }

    /// Consume the matrix, returning the underlying row-major storage
    pub fn take(self) -> Vec<f64> {
        self.data
    }

    pub(super) fn swap_rows(&mut self, i: usize, j: usize) {
        for k in 0..self.cols {
            self.data.swap(i * self.cols + k, j * self.cols + k);
        }
    }

    /// Add `value` to every diagonal element (ridge penalty)
    pub fn add_diagonal(&mut self, value: f64) {
        for i in 0..self.rows.min(self.cols) {
            self[(i, i)] += value;
        }
    }

    // Use power method to find the eigenvector with the largest
    // corresponding eigenvalue
    pub fn power_method(&self, initial: &[f64]) -> Vec<f64> {
        let n = norm(initial);
        let mut v = initial.iter().map(|i| i / n).collect::<Vec<_>>();

        let mut last_eig = 0.0;
        for _ in 0..50 {
            let mut v1 = self.dotv(&v);
            let norm = norm(&v1);
            if (norm - last_eig).abs() < 1E-8 {
                break;
            }
            last_eig = norm;
            v1.iter_mut().for_each(|x| *x /= norm);
            v = v1;
        }
        v
    }

    pub fn transpose(&self) -> Matrix {
        let mut mat = Matrix::zeros(self.cols, self.rows);
        for row in 0..self.rows {
            for col in 0..self.cols {
                mat[(col, row)] = self[(row, col)]
            }
        }
        mat
    }

    pub fn dotv(&self, rhs: &[f64]) -> Vec<f64> {
        assert_eq!(
            self.cols,
            rhs.len(),
            "lhs has shape ({},{}), rhs has shape (1,{})",
            self.rows,
            self.cols,
            rhs.len()
        );
        (0..self.rows)
            .map(|row| {
                self.row(row)
                    .iter()
                    .zip(rhs)
                    .fold(0.0, |acc, (x, y)| acc + x * y)
            })
            .collect()
    }

    pub fn dot(&self, rhs: &Matrix) -> Matrix {
        assert_eq!(
            self.cols, rhs.rows,
            "lhs has shape ({},{}), rhs has shape ({},{})",
            self.rows, self.cols, rhs.rows, rhs.cols
        );
        let data = (0..self.rows)
            .into_par_iter()
            .flat_map_iter(|row| {
                (0..rhs.cols).map(move |col| {
                    self.row(row)
                        .iter()
                        .zip(rhs.col(col))
                        .fold(0.0, |acc, (x, y)| acc + x * y)
                })
            })
            .collect::<Vec<_>>();
        Matrix {
            data,
            rows: self.rows,
            cols: rhs.cols,
        }
    }

    /// Calculate mean of each column
    pub fn mean(&self) -> Vec<f64> {
        (0..self.cols)
            .map(|col| self.col(col).sum::<f64>() / self.rows as f64)
            .collect()
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = f64;

    fn index(&self, (row, col): (usize, usize)) -> &Self::Output {
        &self.data[self.cols * row + col]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (row, col): (usize, usize)) -> &mut Self::Output {
        &mut self.data[self.cols * row + col]
    }
}

impl AddAssign<Matrix> for Matrix {
    fn add_assign(&mut self, rhs: Matrix) {
        assert_eq!(
            self.shape(),
            rhs.shape(),
            "matrices must have equal shape to add"
        );
        self.data
            .iter_mut()
            .zip(rhs.data)
            .for_each(|(lhs, rhs)| *lhs += rhs);
    }
}

impl Debug for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[")?;
        for row in 0..self.rows {
            writeln!(f, "{:?}", self.row(row))?;
        }
        writeln!(f, "]")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dotv() {
        let a = Matrix::new([1., 2., 3., 4.], 2, 2);

        let v0 = a.dotv(&[0.5, 0.5]);
        assert_eq!(v0, vec![1.5, 3.5]);
    }

    #[test]
    fn tranpose() {
        let mat = Matrix::new([1., 2., 3., 4., 5., 6.], 3, 2);
        assert_eq!(mat.row(1), &[3., 4.]);
        assert_eq!(mat.col(1).collect::<Vec<_>>(), vec![2., 4., 6.]);

        let mat = mat.transpose();
        assert_eq!(mat.shape(), (2, 3));
        assert_eq!(mat.row(0), &[1., 3., 5.]);
        assert_eq!(mat.row(1), &[2., 4., 6.]);
    }

    #[test]
    fn dot() {
        #[rustfmt::skip]
        let a = Matrix::new([
            1., 0., 1.,
            2., 1., 1.,
            0., 1., 1.,
            1., 1., 2.
        ], 4, 3);

        #[rustfmt::skip]
        let b = Matrix::new([
            1., 2., 1.,
            2., 3., 1.,
            4., 2., 2.
        ], 3, 3);

        let c = a.dot(&b);
        assert_eq!(c.shape(), (4, 3));
        #[rustfmt::skip]
        assert_eq!(c.take(), vec![
            5., 4., 3.,
            8., 9., 5.,
            6., 5., 3.,
            11., 9., 6.
        ]);
    }

    #[test]
    fn from_rows_and_ridge() {
        let rows = [vec![1.0, 2.0], vec![3.0, 4.0]];
        let mut m = Matrix::from_rows(rows.iter().map(|r| r.as_slice()), 2);
        m.add_diagonal(0.5);
        assert_eq!(m.take(), vec![1.5, 2.0, 3.0, 4.5]);
    }
}
