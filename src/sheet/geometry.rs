//! Page grid geometry and millimeter/pixel conversion.
//!
//! Everything here is pure: the grid layout is fully determined by the card
//! size and spacing, and the same math drives both the screen preview and the
//! high resolution export.

use serde::Serialize;

/// A4 portrait, the only supported sheet size.
pub const PAGE_WIDTH_MM: f32 = 210.0;
pub const PAGE_HEIGHT_MM: f32 = 297.0;

pub const MM_PER_INCH: f32 = 25.4;

/// How many cards fit on a page, and where the grid sits.
///
/// Margins are always the symmetric centering remainder, never negative.
/// A card that does not fit at all yields a zero-capacity grid; callers
/// render a blank page in that case instead of forcing a single cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridGeometry {
    pub cards_per_row: u32,
    pub cards_per_column: u32,
    pub margin_x_mm: f32,
    pub margin_y_mm: f32,
    pub card_width_mm: f32,
    pub card_height_mm: f32,
    pub spacing_mm: f32,
}

impl GridGeometry {
    pub fn compute(card_width_mm: f32, card_height_mm: f32, spacing_mm: f32) -> GridGeometry {
        let zero = GridGeometry {
            cards_per_row: 0,
            cards_per_column: 0,
            margin_x_mm: 0.0,
            margin_y_mm: 0.0,
            card_width_mm,
            card_height_mm,
            spacing_mm,
        };

        let effective_w = card_width_mm + spacing_mm;
        let effective_h = card_height_mm + spacing_mm;
        if !effective_w.is_finite() || !effective_h.is_finite() {
            return zero;
        }
        if effective_w <= 0.0 || effective_h <= 0.0 || card_width_mm <= 0.0 || card_height_mm <= 0.0
        {
            return zero;
        }

        // The last card in a row does not need trailing spacing, hence the
        // (page + spacing) numerator.
        let cards_per_row = ((PAGE_WIDTH_MM + spacing_mm) / effective_w).floor().max(0.0) as u32;
        let cards_per_column = ((PAGE_HEIGHT_MM + spacing_mm) / effective_h).floor().max(0.0) as u32;

        let grid_width = if cards_per_row == 0 {
            0.0
        } else {
            cards_per_row as f32 * card_width_mm + (cards_per_row - 1) as f32 * spacing_mm
        };
        let grid_height = if cards_per_column == 0 {
            0.0
        } else {
            cards_per_column as f32 * card_height_mm + (cards_per_column - 1) as f32 * spacing_mm
        };

        GridGeometry {
            cards_per_row,
            cards_per_column,
            margin_x_mm: ((PAGE_WIDTH_MM - grid_width) / 2.0).max(0.0),
            margin_y_mm: ((PAGE_HEIGHT_MM - grid_height) / 2.0).max(0.0),
            card_width_mm,
            card_height_mm,
            spacing_mm,
        }
    }

    pub fn capacity(&self) -> usize {
        (self.cards_per_row * self.cards_per_column) as usize
    }

    /// Top-left corner of a grid cell, in mm from the page origin.
    /// Returns `None` for indices beyond the grid capacity.
    pub fn cell_origin_mm(&self, index: usize) -> Option<(f32, f32)> {
        if self.cards_per_row == 0 || index >= self.capacity() {
            return None;
        }
        let col = (index as u32) % self.cards_per_row;
        let row = (index as u32) / self.cards_per_row;
        let x = self.margin_x_mm + col as f32 * (self.card_width_mm + self.spacing_mm);
        let y = self.margin_y_mm + row as f32 * (self.card_height_mm + self.spacing_mm);
        Some((x, y))
    }
}

/// Linear mm -> device pixel scale.
///
/// The preview variant derives the scale from the rendered container width,
/// the export variant from a print DPI. An invalid input produces a zero
/// scale so that nothing is drawn with bogus coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PxScale {
    px_per_mm: f32,
}

impl PxScale {
    pub fn from_dpi(dpi: u32) -> PxScale {
        PxScale {
            px_per_mm: dpi as f32 / MM_PER_INCH,
        }
    }

    pub fn from_container_width(width_px: f32) -> PxScale {
        let px_per_mm = if width_px.is_finite() && width_px > 0.0 {
            width_px / PAGE_WIDTH_MM
        } else {
            0.0
        };
        PxScale { px_per_mm }
    }

    pub fn is_valid(&self) -> bool {
        self.px_per_mm > 0.0
    }

    /// Rounded pixel count for a length in mm. Non-finite input maps to 0
    /// rather than letting a NaN reach a drawing call.
    pub fn to_px(&self, mm: f32) -> u32 {
        let px = mm * self.px_per_mm;
        if !px.is_finite() || px <= 0.0 {
            0
        } else {
            px.round() as u32
        }
    }

    /// Full page size in pixels at this scale.
    pub fn page_size_px(&self) -> (u32, u32) {
        (self.to_px(PAGE_WIDTH_MM), self.to_px(PAGE_HEIGHT_MM))
    }
}
