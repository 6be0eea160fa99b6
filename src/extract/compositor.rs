//! Pack paired crops into composite images, one recognition call each.
//!
//! Every pair becomes a small image with the name crop on top and the
//! quantity crop below it. Pair images are then stacked into composites of at
//! most `max_pairs_per_composite` pairs. Alongside the pixels, each composite
//! records where every pair landed ([`PairBounds`]), which is what lets
//! [`super::reattribution`] map recognized text back to its pair.
//!
//! ```text
//!  top ─────┬──────────────┐
//!           │  name crop   │
//!  split_y ─┼ ─ ─ ─ ─ ─ ─ ─│  <- padding / 2 below the name crop
//!           │ quantity crop│
//!  bottom ──┴──────────────┘
//!             padding
//!  top ─────┬──────────────┐  next pair
//! ```

use image::{Rgb, RgbImage, imageops};

use super::pairing::RegionPair;

/// Background for the space between crops.
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

/// Packing limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchLimits {
    /// Maximum pairs per composite. Values below 1 are treated as 1.
    pub max_pairs_per_composite: usize,
    /// Gap, in pixels, between the crops of a pair and between pairs.
    pub padding: u32,
}

/// One pair rendered as a single image.
#[derive(Clone, Debug)]
pub struct PairImage {
    pub image: RgbImage,
    /// Boundary between the name and quantity parts, from the top of `image`.
    pub split_offset: u32,
}

/// Where a pair was placed inside a composite, in composite pixels.
///
/// `top < split_y < bottom` always holds, and the next pair starts at
/// `bottom + padding`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PairBounds {
    pub top: u32,
    pub bottom: u32,
    pub split_y: u32,
}

/// Several pairs stacked into one image.
#[derive(Clone, Debug)]
pub struct CompositeImage {
    pub image: RgbImage,
    /// One entry per packed pair, in pairing order.
    pub bounds: Vec<PairBounds>,
}

/// Render one pair.
pub fn build_pair_image(page: &RgbImage, pair: &RegionPair, padding: u32) -> PairImage {
    let name = crop_box(page, &pair.name);
    let quantity = crop_box(page, &pair.quantity);

    let width = name.width().max(quantity.width());
    let height = name.height() + quantity.height() + padding;
    let mut image = RgbImage::from_pixel(width, height, BACKGROUND);
    imageops::replace(&mut image, &name, 0, 0);
    imageops::replace(&mut image, &quantity, 0, i64::from(name.height() + padding));

    PairImage {
        image,
        split_offset: name.height() + padding / 2,
    }
}

/// Render all pairs of a page and pack them into composites, preserving
/// pairing order.
pub fn compose_batches(
    page: &RgbImage,
    pairs: &[RegionPair],
    limits: BatchLimits,
) -> Vec<CompositeImage> {
    pairs
        .chunks(limits.max_pairs_per_composite.max(1))
        .map(|batch| {
            let pair_images = batch
                .iter()
                .map(|pair| build_pair_image(page, pair, limits.padding))
                .collect::<Vec<_>>();
            stack_pair_images(&pair_images, limits.padding)
        })
        .collect()
}

/// Stack pair images top to bottom, converting each local split offset into
/// composite coordinates.
pub fn stack_pair_images(pair_images: &[PairImage], padding: u32) -> CompositeImage {
    let width = pair_images.iter().map(|p| p.image.width()).max().unwrap_or(0);
    let gaps = u32::try_from(pair_images.len().saturating_sub(1)).unwrap_or(u32::MAX);
    let height =
        pair_images.iter().map(|p| p.image.height()).sum::<u32>() + gaps * padding;

    let mut image = RgbImage::from_pixel(width, height, BACKGROUND);
    let mut bounds = Vec::with_capacity(pair_images.len());
    let mut top = 0;
    for pair_image in pair_images {
        imageops::replace(&mut image, &pair_image.image, 0, i64::from(top));
        let bottom = top + pair_image.image.height();
        bounds.push(PairBounds {
            top,
            bottom,
            split_y: top + pair_image.split_offset,
        });
        top = bottom + padding;
    }
    CompositeImage { image, bounds }
}

fn crop_box(page: &RgbImage, bbox: &super::geometry::BoundingBox) -> RgbImage {
    let rect = bbox.to_pixel_rect(page.width(), page.height());
    imageops::crop_imm(page, rect.x, rect.y, rect.width, rect.height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::geometry::BoundingBox;

    /// A page where every pixel encodes its own row, so crops can be checked.
    fn page(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |_, y| Rgb([(y % 250) as u8, 0, 0]))
    }

    fn pair(y: f32, name_h: f32, quantity_h: f32) -> RegionPair {
        RegionPair {
            name: BoundingBox::new(10.0, y, 110.0, y + name_h),
            quantity: BoundingBox::new(200.0, y, 240.0, y + quantity_h),
        }
    }

    const LIMITS: BatchLimits = BatchLimits {
        max_pairs_per_composite: 12,
        padding: 20,
    };

    #[test]
    fn pair_image_stacks_name_over_quantity() {
        let page = page(300, 300);
        let pair_image = build_pair_image(&page, &pair(50.0, 30.0, 25.0), 20);
        assert_eq!(pair_image.image.dimensions(), (100, 30 + 25 + 20));
        assert_eq!(pair_image.split_offset, 30 + 10);
        // First row of the name crop is page row 50.
        assert_eq!(pair_image.image.get_pixel(0, 0), &Rgb([50, 0, 0]));
        // The gap is background.
        assert_eq!(pair_image.image.get_pixel(0, 35), &BACKGROUND);
        // First row of the quantity crop, which is narrower than the name.
        assert_eq!(pair_image.image.get_pixel(0, 50), &Rgb([50, 0, 0]));
        assert_eq!(pair_image.image.get_pixel(60, 50), &BACKGROUND);
    }

    #[test]
    fn thirty_pairs_make_three_composites() {
        let page = page(300, 2000);
        let pairs = (0..30)
            .map(|i| pair(10.0 + 60.0 * i as f32, 20.0, 20.0))
            .collect::<Vec<_>>();
        let composites = compose_batches(&page, &pairs, LIMITS);
        let counts = composites.iter().map(|c| c.bounds.len()).collect::<Vec<_>>();
        assert_eq!(counts, vec![12, 12, 6]);
    }

    #[test]
    fn no_pairs_means_no_composites() {
        assert!(compose_batches(&page(10, 10), &[], LIMITS).is_empty());
    }

    #[test]
    fn bounds_cover_each_pair_without_overlap() {
        let page = page(300, 1000);
        let pairs = [pair(10.0, 30.0, 15.0), pair(100.0, 12.0, 40.0), pair(300.0, 1.0, 1.0)];
        let composites = compose_batches(&page, &pairs, LIMITS);
        assert_eq!(composites.len(), 1);
        let composite = &composites[0];

        let heights = [30 + 15 + 20, 12 + 40 + 20, 1 + 1 + 20];
        let mut expected_top = 0;
        for (bounds, height) in composite.bounds.iter().zip(heights) {
            assert_eq!(bounds.top, expected_top);
            assert_eq!(bounds.bottom - bounds.top, height);
            assert!(bounds.top < bounds.split_y && bounds.split_y < bounds.bottom);
            expected_top = bounds.bottom + LIMITS.padding;
        }
        assert_eq!(composite.bounds[0].split_y, 30 + 10);
        assert_eq!(composite.bounds[1].split_y, 85 + 12 + 10);

        // Pairs plus the gaps between them fill the whole composite.
        let last = composite.bounds.last().expect("three bounds");
        assert_eq!(composite.image.height(), last.bottom);
        assert_eq!(composite.image.width(), 100);
    }

    #[test]
    fn pixels_land_where_bounds_say() {
        let page = page(300, 1000);
        let pairs = [pair(10.0, 30.0, 15.0), pair(100.0, 12.0, 40.0)];
        let composite = compose_batches(&page, &pairs, LIMITS).remove(0);
        let second = composite.bounds[1];
        assert_eq!(composite.image.get_pixel(0, second.top), &Rgb([100, 0, 0]));
        assert_eq!(composite.image.get_pixel(0, second.bottom - 1), &Rgb([139, 0, 0]));
    }
}
