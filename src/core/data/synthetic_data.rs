use rand::prelude::*;
use rand_distr::weighted::WeightedAliasIndex;

use crate::core::data::sparse_structures::{CountMatrix, CsrMatrix};
use crate::error::{Result, ScrubletError};

////////////////
// Structures //
////////////////

/// Structure to keep the CellTypeConfig
///
/// ### Fields
///
/// * `marker_genes` - Which indices are the marker genes for this specific
///   cell type
/// * `marker_exp_range` - Range of expression of the marker genes with
///   `(min, max)`.
/// * `markers_per_cell` - Number of markers per cell.
#[derive(Clone, Debug)]
pub struct CellTypeConfig {
    pub marker_genes: Vec<usize>,
    pub marker_exp_range: (u32, u32),
    pub markers_per_cell: (usize, usize),
}

impl CellTypeConfig {
    /// Cell type with a fixed set of marker genes and the default expression
    /// ranges
    pub fn with_markers(marker_genes: Vec<usize>) -> Self {
        let n = marker_genes.len();
        Self {
            marker_genes,
            marker_exp_range: (10, 50),
            markers_per_cell: ((n / 2).max(1), n.max(1)),
        }
    }
}

/// Synthetic counts with known cell types and spiked-in doublets
///
/// ### Fields
///
/// * `counts` - The counts (singlets first, then the spiked-in doublets).
/// * `cell_types` - Cell type per singlet; doublets carry the type of their
///   first parent.
/// * `is_doublet` - Ground truth doublet label per row.
#[derive(Clone, Debug)]
pub struct SyntheticCounts {
    pub counts: CountMatrix,
    pub cell_types: Vec<usize>,
    pub is_doublet: Vec<bool>,
}

///////////////
// Functions //
///////////////

/// Create synthetic single cell counts with specific cell types
///
/// Cells are assigned round-robin to the cell types. Each cell expresses a
/// random subset of its marker genes plus a sparse background drawn from an
/// inverse-rank weighting over all genes.
///
/// ### Params
///
/// * `n_cells` - Number of rows (cells).
/// * `n_genes` - Number of columns (genes).
/// * `cell_type_configs` - A slice of cell type configurations.
/// * `background_genes_exp` - The range of background genes expressed per
///   cell.
/// * `background_exp_range` - The range of the expression in the background
///   genes.
/// * `seed` - Integer for reproducibility purposes
///
/// ### Returns
///
/// A tuple with `(counts, cell type per cell)`
pub fn create_celltype_counts(
    n_cells: usize,
    n_genes: usize,
    cell_type_configs: &[CellTypeConfig],
    background_genes_exp: (usize, usize),
    background_exp_range: (u32, u32),
    seed: usize,
) -> Result<(CountMatrix, Vec<usize>)> {
    if cell_type_configs.is_empty() || n_genes == 0 {
        return Err(ScrubletError::param(
            "need at least one cell type and one gene",
        ));
    }
    if cell_type_configs
        .iter()
        .any(|c| c.marker_genes.iter().any(|&g| g >= n_genes))
    {
        return Err(ScrubletError::param("marker gene index out of bounds"));
    }

    let mut indptr = Vec::with_capacity(n_cells + 1);
    let mut indices = Vec::with_capacity(n_cells * 32);
    let mut data = Vec::with_capacity(n_cells * 32);
    let mut cell_type_labels = Vec::with_capacity(n_cells);
    indptr.push(0);
    let n_cell_types = cell_type_configs.len();
    let mut temp_vec: Vec<(usize, u32)> = Vec::with_capacity(n_genes);

    // inverse distribution makes the background sparse
    let weights: Vec<f64> = (1..=n_genes).map(|i| 1.0 / i as f64).collect();
    let alias =
        WeightedAliasIndex::new(weights).map_err(|e| ScrubletError::param(e.to_string()))?;

    for cell_idx in 0..n_cells {
        let mut rng = StdRng::seed_from_u64(seed as u64 + cell_idx as u64);
        let cell_type = cell_idx % n_cell_types;
        cell_type_labels.push(cell_type);
        let config = &cell_type_configs[cell_type];
        temp_vec.clear();

        let n_markers = rng.random_range(config.markers_per_cell.0..=config.markers_per_cell.1);
        let marker_indices: Vec<usize> = config
            .marker_genes
            .choose_multiple(&mut rng, n_markers.min(config.marker_genes.len()))
            .copied()
            .collect();

        for &gene_idx in &marker_indices {
            let count = rng.random_range(config.marker_exp_range.0..=config.marker_exp_range.1);
            temp_vec.push((gene_idx, count));
        }

        let n_background = rng.random_range(background_genes_exp.0..=background_genes_exp.1);
        for _ in 0..n_background {
            let gene_idx = alias.sample(&mut rng);
            if !marker_indices.contains(&gene_idx) {
                let count = rng.random_range(background_exp_range.0..=background_exp_range.1);
                temp_vec.push((gene_idx, count));
            }
        }

        // sort and sum duplicated genes
        temp_vec.sort_unstable_by_key(|(gene_idx, _)| *gene_idx);
        let mut i = 0;
        while i < temp_vec.len() {
            let gene_idx = temp_vec[i].0;
            let mut total_count = temp_vec[i].1;
            let mut j = i + 1;
            while j < temp_vec.len() && temp_vec[j].0 == gene_idx {
                total_count += temp_vec[j].1;
                j += 1;
            }
            if total_count > 0 {
                indices.push(gene_idx);
                data.push(total_count);
            }
            i = j;
        }
        indptr.push(indices.len());
    }

    let csr = CsrMatrix::new(data, indices, indptr, (n_cells, n_genes))?;
    Ok((CountMatrix::new(csr), cell_type_labels))
}

/// Append true doublets of two different cell types to synthetic counts
///
/// ### Params
///
/// * `counts` - The singlet counts.
/// * `cell_types` - Cell type per singlet.
/// * `n_doublets` - Number of doublets to append.
/// * `seed` - Integer for reproducibility purposes.
///
/// ### Returns
///
/// `SyntheticCounts` with the doublets as the last `n_doublets` rows.
pub fn spike_in_doublets(
    counts: &CountMatrix,
    cell_types: &[usize],
    n_doublets: usize,
    seed: usize,
) -> Result<SyntheticCounts> {
    let n_cells = counts.n_cells();
    if cell_types.len() != n_cells {
        return Err(ScrubletError::Dimension(
            "one cell type per cell required".to_string(),
        ));
    }
    if n_doublets > 0 && cell_types.iter().all(|&t| t == cell_types[0]) {
        return Err(ScrubletError::param(
            "doublets need at least two different cell types",
        ));
    }

    let mut rng = StdRng::seed_from_u64(seed as u64);
    let mut rows: Vec<Vec<u32>> = (0..n_cells)
        .map(|i| dense_row(&counts.counts, i))
        .collect();
    let mut types = cell_types.to_vec();

    for _ in 0..n_doublets {
        let (i, j) = loop {
            let i = rng.random_range(0..n_cells);
            let j = rng.random_range(0..n_cells);
            if cell_types[i] != cell_types[j] {
                break (i, j);
            }
        };
        let summed: Vec<u32> = rows[i].iter().zip(&rows[j]).map(|(a, b)| a + b).collect();
        rows.push(summed);
        types.push(cell_types[i]);
    }

    let mut is_doublet = vec![false; n_cells];
    is_doublet.extend(std::iter::repeat_n(true, n_doublets));

    Ok(SyntheticCounts {
        counts: CountMatrix::from_dense_rows(&rows)?,
        cell_types: types,
        is_doublet,
    })
}

fn dense_row(counts: &CsrMatrix<u32>, i: usize) -> Vec<u32> {
    let mut row = vec![0_u32; counts.ncols()];
    let (idx, values) = counts.row(i);
    for (&j, &v) in idx.iter().zip(values) {
        row[j] = v;
    }
    row
}

///////////
// Tests //
///////////
