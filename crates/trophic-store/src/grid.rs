//! The environment grid: a copy-on-write 2D field of nutrient values.

use std::sync::Arc;

use crate::StoreError;

/// A `width x height` field of `f32` cells in row-major order.
///
/// Cells live behind an `Arc`, so cloning a grid (for a snapshot) is O(1); the
/// first mutation of a shared grid copies the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentGrid {
    width: u32,
    height: u32,
    cells: Arc<Vec<f32>>,
}

impl EnvironmentGrid {
    /// A grid with every cell set to `value`.
    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            width,
            height,
            cells: Arc::new(vec![value; width as usize * height as usize]),
        }
    }

    /// Build a grid from a row-major cell buffer.
    pub fn from_cells(width: u32, height: u32, cells: Vec<f32>) -> Result<Self, StoreError> {
        let expected = width as usize * height as usize;
        if cells.len() != expected {
            return Err(StoreError::GridSizeMismatch {
                width,
                height,
                expected,
                actual: cells.len(),
            });
        }
        Ok(Self {
            width,
            height,
            cells: Arc::new(cells),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }

    pub(crate) fn check_bounds(&self, x: i32, y: i32) -> Result<(), StoreError> {
        if self.contains(x, y) {
            Ok(())
        } else {
            Err(StoreError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            })
        }
    }

    fn offset(&self, x: i32, y: i32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    pub fn get(&self, x: i32, y: i32) -> Option<f32> {
        self.contains(x, y).then(|| self.cells[self.offset(x, y)])
    }

    /// Set one cell.
    ///
    /// # Errors
    ///
    /// [`StoreError::OutOfBounds`] if `(x, y)` is outside the grid.
    pub fn set(&mut self, x: i32, y: i32, value: f32) -> Result<(), StoreError> {
        self.check_bounds(x, y)?;
        let offset = self.offset(x, y);
        Arc::make_mut(&mut self.cells)[offset] = value;
        Ok(())
    }

    /// Sum of all cells.
    pub fn total(&self) -> f64 {
        self.cells.iter().map(|&c| f64::from(c)).sum()
    }

    /// Whether this grid and `other` share the same cell buffer.
    pub fn shares_cells_with(&self, other: &EnvironmentGrid) -> bool {
        Arc::ptr_eq(&self.cells, &other.cells)
    }
}
