//! Boxes in page and composite pixel space.

/// An axis-aligned box, in pixels, with `y` growing downwards.
///
/// Coordinates come straight from detectors and recognizers, so they are
/// fractional and not guaranteed to be ordered or inside the image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// The smallest box containing all of `points`, or `None` if there are
    /// no points.
    pub fn enclosing(points: impl IntoIterator<Item = (f32, f32)>) -> Option<Self> {
        points.into_iter().fold(None, |acc, (x, y)| {
            Some(match acc {
                None => Self::new(x, y, x, y),
                Some(b) => Self::new(b.x1.min(x), b.y1.min(y), b.x2.max(x), b.y2.max(y)),
            })
        })
    }

    /// Vertical center.
    pub fn center_y(&self) -> f32 {
        (self.y1 + self.y2) * 0.5
    }

    /// Round this box to whole pixels and clamp it to a `width` x `height`
    /// image.
    ///
    /// Degenerate boxes still cover at least one pixel, so every crop of a
    /// non-empty image is non-empty.
    pub fn to_pixel_rect(&self, width: u32, height: u32) -> PixelRect {
        let (x, width) = clamp_span(self.x1, self.x2, width);
        let (y, height) = clamp_span(self.y1, self.y2, height);
        PixelRect {
            x,
            y,
            width,
            height,
        }
    }
}

/// An integer crop rectangle inside an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Clamp the span between `a` and `b` to `0..limit`, returning its start and
/// length.
fn clamp_span(a: f32, b: f32, limit: u32) -> (u32, u32) {
    if limit == 0 {
        return (0, 0);
    }
    let to_px = |v: f32| -> u32 {
        if v.is_nan() {
            0
        } else {
            (v.round().max(0.0) as u32).min(limit)
        }
    };
    let start = to_px(a.min(b));
    let end = to_px(a.max(b));
    if end > start {
        (start, end - start)
    } else {
        (start.min(limit - 1), 1)
    }
}
