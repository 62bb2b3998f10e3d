use faer::Mat;

use crate::error::{Result, ScrubletError};

////////////////
// Structures //
////////////////

/// Structure for compressed sparse row data
///
/// ### Fields
///
/// * `data` - Vector with the non-zero values.
/// * `indices` - The column indices of the values.
/// * `indptr` - The row pointers into `data` and `indices`.
/// * `shape` - Tuple of `(nrow, ncol)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T> {
    pub data: Vec<T>,
    pub indices: Vec<usize>,
    pub indptr: Vec<usize>,
    pub shape: (usize, usize),
}

impl<T> CsrMatrix<T>
where
    T: Copy + Default + PartialEq,
{
    /// Generate a new CSR matrix and check its structure
    ///
    /// ### Params
    ///
    /// * `data` - The non-zero values.
    /// * `indices` - Column index per value. Must be strictly increasing
    ///   within each row.
    /// * `indptr` - Row pointers of length `nrow + 1`.
    /// * `shape` - Tuple of `(nrow, ncol)`.
    pub fn new(
        data: Vec<T>,
        indices: Vec<usize>,
        indptr: Vec<usize>,
        shape: (usize, usize),
    ) -> Result<Self> {
        let (nrow, ncol) = shape;
        if indptr.len() != nrow + 1 {
            return Err(ScrubletError::Dimension(format!(
                "indptr has length {}, expected {}",
                indptr.len(),
                nrow + 1
            )));
        }
        if data.len() != indices.len() || indptr[nrow] != data.len() || indptr[0] != 0 {
            return Err(ScrubletError::Dimension(
                "data, indices and indptr are inconsistent".to_string(),
            ));
        }
        for row in 0..nrow {
            let (start, end) = (indptr[row], indptr[row + 1]);
            if start > end {
                return Err(ScrubletError::Dimension(format!(
                    "indptr is decreasing at row {}",
                    row
                )));
            }
            let row_idx = &indices[start..end];
            if row_idx.iter().any(|&j| j >= ncol) || row_idx.windows(2).any(|w| w[0] >= w[1]) {
                return Err(ScrubletError::Dimension(format!(
                    "column indices of row {} are out of bounds or unsorted",
                    row
                )));
            }
        }

        Ok(Self {
            data,
            indices,
            indptr,
            shape,
        })
    }

    /// Convert a dense row-major representation into CSR
    ///
    /// ### Params
    ///
    /// * `rows` - One vector per row, all of the same length.
    pub fn from_dense_rows(rows: &[Vec<T>]) -> Result<Self> {
        let nrow = rows.len();
        let ncol = rows.first().map(|r| r.len()).unwrap_or(0);

        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = Vec::with_capacity(nrow + 1);
        indptr.push(0_usize);

        for (i, row) in rows.iter().enumerate() {
            if row.len() != ncol {
                return Err(ScrubletError::Dimension(format!(
                    "row {} has {} columns, expected {}",
                    i,
                    row.len(),
                    ncol
                )));
            }
            for (j, &value) in row.iter().enumerate() {
                if value != T::default() {
                    data.push(value);
                    indices.push(j);
                }
            }
            indptr.push(data.len());
        }

        Ok(Self {
            data,
            indices,
            indptr,
            shape: (nrow, ncol),
        })
    }

    /// Number of rows
    pub fn nrows(&self) -> usize {
        self.shape.0
    }

    /// Number of columns
    pub fn ncols(&self) -> usize {
        self.shape.1
    }

    /// Number of stored values
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// Get the column indices and values of one row
    #[inline]
    pub fn row(&self, i: usize) -> (&[usize], &[T]) {
        let (start, end) = (self.indptr[i], self.indptr[i + 1]);
        (&self.indices[start..end], &self.data[start..end])
    }

    /// Apply a function to every stored value, keeping the sparsity pattern
    pub fn map_values<U, F>(&self, f: F) -> CsrMatrix<U>
    where
        F: Fn(usize, T) -> U,
    {
        let mut data = Vec::with_capacity(self.nnz());
        for row in 0..self.nrows() {
            let (_, values) = self.row(row);
            data.extend(values.iter().map(|&v| f(row, v)));
        }
        CsrMatrix {
            data,
            indices: self.indices.clone(),
            indptr: self.indptr.clone(),
            shape: self.shape,
        }
    }

    /// Subset the matrix to a set of rows, in the given order
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = Vec::with_capacity(rows.len() + 1);
        indptr.push(0_usize);
        for &row in rows {
            let (idx, values) = self.row(row);
            indices.extend_from_slice(idx);
            data.extend_from_slice(values);
            indptr.push(data.len());
        }
        Self {
            data,
            indices,
            indptr,
            shape: (rows.len(), self.ncols()),
        }
    }

    /// Subset the matrix to the columns retained by a gene filter
    ///
    /// The columns are re-indexed to their position within the filter.
    pub fn select_columns(&self, filter: &GeneFilter) -> Self {
        let mut new_index = vec![usize::MAX; self.ncols()];
        for (new_j, &old_j) in filter.indices().iter().enumerate() {
            new_index[old_j] = new_j;
        }

        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = Vec::with_capacity(self.nrows() + 1);
        indptr.push(0_usize);
        for row in 0..self.nrows() {
            let (idx, values) = self.row(row);
            for (&j, &v) in idx.iter().zip(values) {
                let new_j = new_index[j];
                if new_j != usize::MAX {
                    indices.push(new_j);
                    data.push(v);
                }
            }
            indptr.push(data.len());
        }
        Self {
            data,
            indices,
            indptr,
            shape: (self.nrows(), filter.len()),
        }
    }
}

impl CsrMatrix<f32> {
    /// Densify into a faer matrix (cells x genes)
    pub fn to_dense(&self) -> Mat<f32> {
        let mut dense = Mat::<f32>::zeros(self.nrows(), self.ncols());
        for i in 0..self.nrows() {
            let (idx, values) = self.row(i);
            for (&j, &v) in idx.iter().zip(values) {
                dense[(i, j)] = v;
            }
        }
        dense
    }
}

/// Raw UMI counts with the per cell library sizes
///
/// The library sizes are carried separately from the matrix, as they refer to
/// all genes of the original data, also after a gene filter was applied.
///
/// ### Fields
///
/// * `counts` - The raw counts with cells as rows and genes as columns.
/// * `total_counts` - Library size of each cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CountMatrix {
    pub counts: CsrMatrix<u32>,
    pub total_counts: Vec<usize>,
}

impl CountMatrix {
    /// Wrap raw counts and derive the library sizes from the row sums
    pub fn new(counts: CsrMatrix<u32>) -> Self {
        let total_counts = row_sums(&counts);
        Self {
            counts,
            total_counts,
        }
    }

    /// Wrap raw counts with pre-computed library sizes
    ///
    /// ### Params
    ///
    /// * `counts` - The raw counts.
    /// * `total_counts` - One library size per row.
    pub fn with_totals(counts: CsrMatrix<u32>, total_counts: Vec<usize>) -> Result<Self> {
        if total_counts.len() != counts.nrows() {
            return Err(ScrubletError::Dimension(format!(
                "{} total counts supplied for {} cells",
                total_counts.len(),
                counts.nrows()
            )));
        }
        Ok(Self {
            counts,
            total_counts,
        })
    }

    /// Build from dense rows, deriving the library sizes
    pub fn from_dense_rows(rows: &[Vec<u32>]) -> Result<Self> {
        Ok(Self::new(CsrMatrix::from_dense_rows(rows)?))
    }

    /// Number of cells
    pub fn n_cells(&self) -> usize {
        self.counts.nrows()
    }

    /// Number of genes
    pub fn n_genes(&self) -> usize {
        self.counts.ncols()
    }

    /// Subset to a set of cells, keeping their library sizes
    pub fn select_cells(&self, cells: &[usize]) -> Self {
        Self {
            counts: self.counts.select_rows(cells),
            total_counts: cells.iter().map(|&i| self.total_counts[i]).collect(),
        }
    }

    /// Apply a gene filter, keeping the library sizes of the full data
    pub fn select_genes(&self, filter: &GeneFilter) -> Self {
        Self {
            counts: self.counts.select_columns(filter),
            total_counts: self.total_counts.clone(),
        }
    }
}

/// Ordered set of retained gene (column) indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneFilter {
    indices: Vec<usize>,
}

impl GeneFilter {
    /// Generate a filter from column indices
    ///
    /// ### Params
    ///
    /// * `indices` - Indices of the genes to keep. Will be sorted and
    ///   de-duplicated.
    /// * `n_genes` - Number of genes in the unfiltered data.
    pub fn new(mut indices: Vec<usize>, n_genes: usize) -> Result<Self> {
        indices.sort_unstable();
        indices.dedup();
        if let Some(&max) = indices.last() {
            if max >= n_genes {
                return Err(ScrubletError::Dimension(format!(
                    "gene index {} out of bounds for {} genes",
                    max, n_genes
                )));
            }
        }
        Ok(Self { indices })
    }

    /// A filter that keeps every gene
    pub fn all(n_genes: usize) -> Self {
        Self {
            indices: (0..n_genes).collect(),
        }
    }

    /// The retained indices (sorted)
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Number of retained genes
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Is the filter empty
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/////////////
// Helpers //
/////////////

/// Row sums of a count matrix
pub fn row_sums(counts: &CsrMatrix<u32>) -> Vec<usize> {
    (0..counts.nrows())
        .map(|i| counts.row(i).1.iter().map(|&v| v as usize).sum())
        .collect()
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn small_counts() -> CountMatrix {
        CountMatrix::from_dense_rows(&[vec![1, 0, 3], vec![0, 0, 0], vec![2, 5, 0]]).unwrap()
    }

    #[test]
    fn test_from_dense_rows() {
        let m = small_counts();
        assert_eq!(m.counts.shape, (3, 3));
        assert_eq!(m.counts.nnz(), 4);
        assert_eq!(m.total_counts, vec![4, 0, 7]);
        assert_eq!(m.counts.row(2), (&[0_usize, 1][..], &[2_u32, 5][..]));
    }

    #[test]
    fn test_invalid_structure() {
        let res = CsrMatrix::new(vec![1_u32, 2], vec![1, 0], vec![0, 2], (1, 3));
        assert!(res.is_err());

        let res = CsrMatrix::new(vec![1_u32], vec![5], vec![0, 1], (1, 3));
        assert!(res.is_err());

        let res = CsrMatrix::new(vec![1_u32], vec![0], vec![0, 1, 1], (1, 3));
        assert!(res.is_err());
    }

    #[test]
    fn test_select_genes_keeps_totals() {
        let m = small_counts();
        let filter = GeneFilter::new(vec![2, 0], 3).unwrap();
        let sub = m.select_genes(&filter);

        assert_eq!(sub.n_genes(), 2);
        assert_eq!(sub.total_counts, vec![4, 0, 7]);
        assert_eq!(sub.counts.row(0), (&[0_usize, 1][..], &[1_u32, 3][..]));
        assert_eq!(sub.counts.row(2), (&[0_usize][..], &[2_u32][..]));
    }

    #[test]
    fn test_select_cells() {
        let m = small_counts();
        let sub = m.select_cells(&[2, 0]);
        assert_eq!(sub.total_counts, vec![7, 4]);
        assert_eq!(sub.counts.row(1), (&[0_usize, 2][..], &[1_u32, 3][..]));
    }

    #[test]
    fn test_gene_filter_bounds() {
        assert!(GeneFilter::new(vec![0, 3], 3).is_err());
        let f = GeneFilter::new(vec![2, 1, 2], 3).unwrap();
        assert_eq!(f.indices(), &[1, 2]);
        assert_eq!(GeneFilter::all(2).indices(), &[0, 1]);
    }

    #[test]
    fn test_totals_length_checked() {
        let m = small_counts();
        assert!(CountMatrix::with_totals(m.counts.clone(), vec![1, 2]).is_err());
    }

    #[test]
    fn test_to_dense() {
        let m = small_counts();
        let dense = m.counts.map_values(|_, v| v as f32).to_dense();
        assert_eq!(dense[(0, 2)], 3.0);
        assert_eq!(dense[(1, 1)], 0.0);
        assert_eq!(dense[(2, 1)], 5.0);
    }
}
