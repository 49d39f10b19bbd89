//! Jacobian storage aware of the dataset structure of a fit.
//!
//! Rows are data points, concatenated dataset after dataset; columns are
//! free parameters. A column belonging to a per-dataset parameter can only
//! be nonzero on the rows of that dataset, which lets JᵗJ and the gradient
//! skip the structurally zero blocks.

use ndarray::{Array1, Array2};
use std::ops::Range;

/// The Jacobian of the weighted residuals.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseJacobian {
    matrix: Array2<f64>,
    column_datasets: Vec<Option<usize>>,
    dataset_offsets: Vec<usize>,
}

impl SparseJacobian {
    /// Create a zero Jacobian.
    ///
    /// # Arguments
    ///
    /// * `dataset_offsets` - Start row of each dataset, followed by the total
    ///   number of rows
    /// * `column_datasets` - For each column, the only dataset it affects, or
    ///   `None` for columns affecting every dataset
    pub fn new(dataset_offsets: Vec<usize>, column_datasets: Vec<Option<usize>>) -> Self {
        let rows = dataset_offsets.last().copied().unwrap_or(0);
        let cols = column_datasets.len();
        Self {
            matrix: Array2::zeros((rows, cols)),
            column_datasets,
            dataset_offsets,
        }
    }

    /// A plain dense Jacobian.
    pub fn dense(rows: usize, cols: usize) -> Self {
        Self::new(vec![0, rows], vec![None; cols])
    }

    pub fn rows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn columns(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    pub fn into_matrix(self) -> Array2<f64> {
        self.matrix
    }

    /// Rows on which column `j` may be nonzero.
    pub fn column_rows(&self, j: usize) -> Range<usize> {
        match self.column_datasets[j] {
            Some(ds) => self.dataset_offsets[ds]..self.dataset_offsets[ds + 1],
            None => 0..self.rows(),
        }
    }

    /// Dataset affected by column `j`, `None` when all are.
    pub fn column_dataset(&self, j: usize) -> Option<usize> {
        self.column_datasets[j]
    }

    /// Whether the block (i, j) of JᵗJ is zero by construction.
    pub fn is_structurally_zero(&self, i: usize, j: usize) -> bool {
        matches!(
            (self.column_datasets[i], self.column_datasets[j]),
            (Some(a), Some(b)) if a != b
        )
    }

    /// Overwrites column `j`. `values` spans all rows; only the rows the
    /// column may affect are copied, the others stay zero.
    pub fn set_column(&mut self, j: usize, values: &[f64]) {
        let rows = self.column_rows(j);
        let mut column = self.matrix.column_mut(j);
        for i in rows {
            column[i] = values[i];
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.matrix[[row, col]]
    }

    /// Multiplies every entry by `factor`.
    pub fn scale(&mut self, factor: f64) {
        self.matrix.mapv_inplace(|v| v * factor);
    }

    /// Computes JᵗJ, skipping structurally zero blocks.
    pub fn compute_jtj(&self) -> Array2<f64> {
        let n = self.columns();
        let mut jtj = Array2::zeros((n, n));
        for i in 0..n {
            for j in i..n {
                if self.is_structurally_zero(i, j) {
                    continue;
                }
                let rows = intersect(self.column_rows(i), self.column_rows(j));
                let ci = self.matrix.column(i);
                let cj = self.matrix.column(j);
                let mut sum = 0.0;
                for r in rows {
                    sum += ci[r] * cj[r];
                }
                jtj[[i, j]] = sum;
                jtj[[j, i]] = sum;
            }
        }
        jtj
    }

    /// Computes `factor * Jᵗ f`.
    pub fn compute_gradient(&self, function: &Array1<f64>, factor: f64) -> Array1<f64> {
        let n = self.columns();
        let mut gradient = Array1::zeros(n);
        for j in 0..n {
            let cj = self.matrix.column(j);
            let mut sum = 0.0;
            for r in self.column_rows(j) {
                sum += cj[r] * function[r];
            }
            gradient[j] = factor * sum;
        }
        gradient
    }
}

fn intersect(a: Range<usize>, b: Range<usize>) -> Range<usize> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    start..end.max(start)
}
