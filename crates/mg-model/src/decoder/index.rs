/// Absolute cache write positions for one update call, one list per batch row.
///
/// Stored flat: `flat_positions` holds every row's positions back to back and
/// `row_splits[b]..row_splits[b + 1]` delimits row `b`. Rows may have
/// different lengths, which is how priming writes prompts of different sizes
/// in a single call.
///
/// Positions are not validated against the cache length; keeping them below
/// `max_length` and unique within a row is the caller's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheUpdateIndex {
    row_splits: Vec<usize>,
    flat_positions: Vec<usize>,
}

impl CacheUpdateIndex {
    /// Build an index from explicit per-row position lists.
    pub fn from_rows(rows: &[Vec<usize>]) -> Self {
        let mut row_splits = Vec::with_capacity(rows.len() + 1);
        row_splits.push(0);
        let mut flat_positions = Vec::new();
        for row in rows {
            flat_positions.extend_from_slice(row);
            row_splits.push(flat_positions.len());
        }
        CacheUpdateIndex {
            row_splits,
            flat_positions,
        }
    }

    /// Row `b` writes positions `0..lengths[b]`. Used when priming a cache
    /// with prompts of per-example lengths.
    pub fn range(lengths: &[usize]) -> Self {
        let rows: Vec<Vec<usize>> = lengths.iter().map(|&len| (0..len).collect()).collect();
        Self::from_rows(&rows)
    }

    /// Every row writes exactly one position.
    pub fn per_row(positions: &[usize]) -> Self {
        CacheUpdateIndex {
            row_splits: (0..=positions.len()).collect(),
            flat_positions: positions.to_vec(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.row_splits.len() - 1
    }

    /// Total number of positions across all rows.
    pub fn len(&self) -> usize {
        self.flat_positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flat_positions.is_empty()
    }

    pub fn row(&self, b: usize) -> &[usize] {
        &self.flat_positions[self.row_splits[b]..self.row_splits[b + 1]]
    }

    pub fn row_lengths(&self) -> Vec<usize> {
        self.row_splits.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Longest row; the query length an update with this index expects.
    pub fn max_row_length(&self) -> usize {
        self.row_lengths().into_iter().max().unwrap_or(0)
    }

    pub fn flat_positions(&self) -> &[usize] {
        &self.flat_positions
    }

    /// Row id of each flat position.
    pub fn value_rowids(&self) -> Vec<usize> {
        self.row_splits
            .windows(2)
            .enumerate()
            .flat_map(|(b, w)| std::iter::repeat(b).take(w[1] - w[0]))
            .collect()
    }

    /// For each flat position, `(row, local rank within the row)`: where the
    /// update value is read from in the `[batch, len, ...]` update tensor.
    pub fn gather_index(&self) -> Vec<(usize, usize)> {
        self.row_splits
            .windows(2)
            .enumerate()
            .flat_map(|(b, w)| (0..w[1] - w[0]).map(move |i| (b, i)))
            .collect()
    }

    /// For each flat position, `(row, absolute position)`: where the update
    /// value is written in the cache.
    pub fn scatter_index(&self) -> Vec<(usize, usize)> {
        self.value_rowids()
            .into_iter()
            .zip(self.flat_positions.iter().copied())
            .collect()
    }

    /// Shift every position forward by one, as after a decode step.
    pub fn advance(&mut self) {
        for p in &mut self.flat_positions {
            *p += 1;
        }
    }

    /// Current (last) write position of each row, `None` for empty rows.
    pub fn positions(&self) -> Vec<Option<usize>> {
        (0..self.batch_size())
            .map(|b| self.row(b).last().copied())
            .collect()
    }

    /// Dense `[batch, len]` grid of positions. Slots past a row's length are
    /// `None`; they correspond to padding in the query sequence.
    pub fn dense_positions(&self, len: usize) -> Vec<Option<usize>> {
        let mut out = vec![None; self.batch_size() * len];
        for b in 0..self.batch_size() {
            for (i, &p) in self.row(b).iter().take(len).enumerate() {
                out[b * len + i] = Some(p);
            }
        }
        out
    }
}
