use faer_core::sparse::SymbolicSparseColMatRef;

/// One active activation entry: atom `atom` fires at valid-time `time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SupportEntry {
    pub atom: usize,
    pub time: usize,
}

/// Column-compressed pattern of `[A_S; sqrt(ridge) I]`, where `A_S` holds the
/// columns of one trial's convolution operator selected by the support.
///
/// Signal rows are indexed `channel * n_times + sample`. Every column ends
/// with one ridge row at `signal_rows + col`.
#[derive(Debug)]
pub(crate) struct SupportPattern {
    signal_rows: usize,
    col_ptrs: Vec<usize>,
    row_indices: Vec<usize>,
    diag_positions: Vec<usize>,
}

impl SupportPattern {
    /// The entry firing at `time` covers samples `time..time + n_times_atom`
    /// in every channel.
    pub(crate) fn new(n_channels: usize, n_times: usize, n_times_atom: usize, support: &[SupportEntry]) -> Self {
        let signal_rows = n_channels * n_times;
        let per_col = n_channels * n_times_atom + 1;
        let mut col_ptrs = Vec::with_capacity(support.len() + 1);
        let mut row_indices = Vec::with_capacity(support.len() * per_col);
        let mut diag_positions = Vec::with_capacity(support.len());
        col_ptrs.push(0);
        for (col, entry) in support.iter().enumerate() {
            debug_assert!(entry.time + n_times_atom <= n_times);
            for c in 0..n_channels {
                let first = c * n_times + entry.time;
                row_indices.extend(first..first + n_times_atom);
            }
            diag_positions.push(row_indices.len());
            row_indices.push(signal_rows + col);
            col_ptrs.push(row_indices.len());
        }
        debug_assert!(
            col_ptrs
                .windows(2)
                .all(|w| row_indices[w[0]..w[1]].windows(2).all(|r| r[0] < r[1]))
        );

        Self {
            signal_rows,
            col_ptrs,
            row_indices,
            diag_positions,
        }
    }

    pub(crate) fn nrows(&self) -> usize {
        self.signal_rows + self.ncols()
    }

    pub(crate) fn ncols(&self) -> usize {
        self.diag_positions.len()
    }

    pub(crate) fn signal_rows(&self) -> usize {
        self.signal_rows
    }

    pub(crate) fn col_ptrs(&self) -> &[usize] {
        &self.col_ptrs
    }

    pub(crate) fn row_indices(&self) -> &[usize] {
        &self.row_indices
    }

    /// Position of each column's ridge entry in `row_indices`.
    pub(crate) fn diag_positions(&self) -> &[usize] {
        &self.diag_positions
    }

    pub(crate) fn as_symbolic(&self) -> SymbolicSparseColMatRef<'_, usize> {
        // SAFETY: col_ptrs starts at 0 and ends at row_indices.len(); rows are
        // strictly increasing per column and below nrows.
        unsafe {
            SymbolicSparseColMatRef::new_unchecked(
                self.nrows(),
                self.ncols(),
                &self.col_ptrs,
                None,
                &self.row_indices,
            )
        }
    }
}
