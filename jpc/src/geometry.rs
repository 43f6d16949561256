/// A point or a size on one of the integer grids (canvas, component,
/// resolution, subband, or an index space such as the tile grid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Coords {
    pub x: i64,
    pub y: i64,
}

impl Coords {
    pub fn new(x: i64, y: i64) -> Coords {
        Coords { x, y }
    }

    pub fn transpose(self) -> Coords {
        Coords {
            x: self.y,
            y: self.x,
        }
    }
}

/// Half-open rectangle `[pos, pos + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub pos: Coords,
    pub size: Coords,
}

impl Rect {
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> Rect {
        Rect {
            pos: Coords::new(x, y),
            size: Coords::new(width.max(0), height.max(0)),
        }
    }

    pub fn from_bounds(x0: i64, y0: i64, x1: i64, y1: i64) -> Rect {
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }

    pub fn lim(&self) -> Coords {
        Coords::new(self.pos.x + self.size.x, self.pos.y + self.size.y)
    }

    pub fn is_empty(&self) -> bool {
        self.size.x <= 0 || self.size.y <= 0
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.size.x * self.size.y
        }
    }

    pub fn contains(&self, point: Coords) -> bool {
        let lim = self.lim();
        point.x >= self.pos.x && point.y >= self.pos.y && point.x < lim.x && point.y < lim.y
    }

    pub fn intersection(&self, other: &Rect) -> Rect {
        let lim = self.lim();
        let other_lim = other.lim();
        Rect::from_bounds(
            self.pos.x.max(other.pos.x),
            self.pos.y.max(other.pos.y),
            lim.x.min(other_lim.x),
            lim.y.min(other_lim.y),
        )
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.intersection(other).is_empty()
    }

    pub fn transpose(self) -> Rect {
        Rect {
            pos: self.pos.transpose(),
            size: self.size.transpose(),
        }
    }

    /// Maps a rectangle through `ceil(v / 2^shift)` on each axis, which is
    /// how image regions shrink from one resolution to the next.
    pub(crate) fn shrink(&self, shift_x: u32, shift_y: u32) -> Rect {
        let lim = self.lim();
        Rect::from_bounds(
            ceil_shift(self.pos.x, shift_x),
            ceil_shift(self.pos.y, shift_y),
            ceil_shift(lim.x, shift_x),
            ceil_shift(lim.y, shift_y),
        )
    }

    /// Expands every edge outwards by `margin`.
    pub(crate) fn grow(&self, margin_x: i64, margin_y: i64) -> Rect {
        let lim = self.lim();
        Rect::from_bounds(
            self.pos.x - margin_x,
            self.pos.y - margin_y,
            lim.x + margin_x,
            lim.y + margin_y,
        )
    }

    /// Indices of the cells of a `2^exp_x x 2^exp_y` grid anchored at the
    /// origin which intersect this rectangle.
    pub(crate) fn cell_indices(&self, exp_x: u32, exp_y: u32) -> Rect {
        if self.is_empty() {
            return Rect::new(0, 0, 0, 0);
        }
        let lim = self.lim();
        Rect::from_bounds(
            floor_shift(self.pos.x, exp_x),
            floor_shift(self.pos.y, exp_y),
            ceil_shift(lim.x, exp_x),
            ceil_shift(lim.y, exp_y),
        )
    }

    /// Cell `index` of the grid used by `cell_indices`, clipped to `self`.
    pub(crate) fn cell(&self, index: Coords, exp_x: u32, exp_y: u32) -> Rect {
        let cell = Rect::new(
            index.x << exp_x,
            index.y << exp_y,
            1i64 << exp_x,
            1i64 << exp_y,
        );
        cell.intersection(self)
    }
}

/// Geometric view applied on top of the codestream's own coordinate system.
///
/// Transposition happens first, then the flips; a flip negates coordinates,
/// so that a flipped rectangle keeps `pos <= lim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Appearance {
    pub transpose: bool,
    pub vflip: bool,
    pub hflip: bool,
}

impl Appearance {
    pub fn new(transpose: bool, vflip: bool, hflip: bool) -> Appearance {
        Appearance {
            transpose,
            vflip,
            hflip,
        }
    }

    pub fn is_identity(&self) -> bool {
        !self.transpose && !self.vflip && !self.hflip
    }

    pub fn is_flipped(&self) -> bool {
        self.vflip || self.hflip
    }

    pub fn rect_to_apparent(&self, rect: Rect) -> Rect {
        let mut rect = if self.transpose { rect.transpose() } else { rect };
        if self.vflip {
            rect.pos.y = -(rect.pos.y + rect.size.y - 1);
        }
        if self.hflip {
            rect.pos.x = -(rect.pos.x + rect.size.x - 1);
        }
        rect
    }

    pub fn rect_to_real(&self, rect: Rect) -> Rect {
        let mut rect = rect;
        if self.vflip {
            rect.pos.y = -(rect.pos.y + rect.size.y - 1);
        }
        if self.hflip {
            rect.pos.x = -(rect.pos.x + rect.size.x - 1);
        }
        if self.transpose {
            rect.transpose()
        } else {
            rect
        }
    }

    pub fn coords_to_apparent(&self, point: Coords) -> Coords {
        let mut point = if self.transpose {
            point.transpose()
        } else {
            point
        };
        if self.vflip {
            point.y = -point.y;
        }
        if self.hflip {
            point.x = -point.x;
        }
        point
    }

    pub fn coords_to_real(&self, point: Coords) -> Coords {
        let mut point = point;
        if self.vflip {
            point.y = -point.y;
        }
        if self.hflip {
            point.x = -point.x;
        }
        if self.transpose {
            point.transpose()
        } else {
            point
        }
    }

    /// Sizes are unaffected by flips.
    pub fn size_to_apparent(&self, size: Coords) -> Coords {
        if self.transpose {
            size.transpose()
        } else {
            size
        }
    }
}

pub(crate) fn ceil_shift(value: i64, shift: u32) -> i64 {
    -((-value) >> shift)
}

pub(crate) fn floor_shift(value: i64, shift: u32) -> i64 {
    value >> shift
}

pub(crate) fn ceil_div(value: i64, divisor: i64) -> i64 {
    -((-value).div_euclid(divisor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_shift_handles_negative_values() {
        assert_eq!(ceil_shift(5, 1), 3);
        assert_eq!(ceil_shift(4, 1), 2);
        assert_eq!(ceil_shift(-1, 1), 0);
        assert_eq!(ceil_shift(-3, 1), -1);
        assert_eq!(ceil_div(7, 2), 4);
        assert_eq!(ceil_div(-7, 2), -3);
    }

    #[test]
    fn test_appearance_is_invertible() {
        let rect = Rect::new(3, 5, 10, 4);
        for bits in 0..8 {
            let appearance = Appearance::new(bits & 1 != 0, bits & 2 != 0, bits & 4 != 0);
            let apparent = appearance.rect_to_apparent(rect);
            assert_eq!(apparent.area(), rect.area());
            assert_eq!(appearance.rect_to_real(apparent), rect);
            let point = Coords::new(-2, 7);
            assert_eq!(
                appearance.coords_to_real(appearance.coords_to_apparent(point)),
                point
            );
        }
    }

    #[test]
    fn test_vflip_negates_rows() {
        let appearance = Appearance::new(false, true, false);
        let apparent = appearance.rect_to_apparent(Rect::new(0, 2, 4, 3));
        assert_eq!(apparent, Rect::new(0, -4, 4, 3));
        assert!(apparent.contains(Coords::new(0, -2)));
        assert!(apparent.contains(Coords::new(0, -4)));
    }

    #[test]
    fn test_cell_indices() {
        let rect = Rect::from_bounds(3, 0, 17, 9);
        assert_eq!(rect.cell_indices(3, 3), Rect::from_bounds(0, 0, 3, 2));
        assert_eq!(rect.cell(Coords::new(0, 1), 3, 3), Rect::from_bounds(3, 8, 8, 9));
    }
}
