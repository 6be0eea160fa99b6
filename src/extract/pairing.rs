//! Pair name regions with quantity regions by vertical rank.

use schemars::JsonSchema;

use super::geometry::BoundingBox;
use crate::prelude::*;

/// The two region classes our detector knows about.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionClass {
    /// An item name or item code.
    Name,
    /// The quantity belonging to an item.
    Quantity,
}

/// A single detected region on a page.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class: RegionClass,
}

/// A name region and the quantity region of the same rank.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionPair {
    pub name: BoundingBox,
    pub quantity: BoundingBox,
}

/// Pair up the detections of one page.
///
/// Each class is sorted top to bottom by `y1`, and the *i*-th name is paired
/// with the *i*-th quantity. Equal `y1` values keep their detection order.
/// Whatever is left over in the longer class is dropped.
pub fn pair_regions(detections: &[Detection]) -> Vec<RegionPair> {
    let names = sorted_boxes(detections, RegionClass::Name);
    let quantities = sorted_boxes(detections, RegionClass::Quantity);
    if names.len() != quantities.len() {
        warn!(
            names = names.len(),
            quantities = quantities.len(),
            "Unequal region counts, dropping surplus detections"
        );
    }
    names
        .into_iter()
        .zip(quantities)
        .map(|(name, quantity)| RegionPair { name, quantity })
        .collect()
}

/// All boxes of `class`, top to bottom. `sort_by` is stable.
fn sorted_boxes(detections: &[Detection], class: RegionClass) -> Vec<BoundingBox> {
    let mut boxes = detections
        .iter()
        .filter(|d| d.class == class)
        .map(|d| d.bbox)
        .collect::<Vec<_>>();
    boxes.sort_by(|a, b| a.y1.total_cmp(&b.y1));
    boxes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class: RegionClass, x1: f32, y1: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, y1, x1 + 50.0, y1 + 20.0),
            class,
        }
    }

    #[test]
    fn pairs_by_rank_not_by_detection_order() {
        let detections = [
            det(RegionClass::Quantity, 300.0, 200.0),
            det(RegionClass::Name, 10.0, 210.0),
            det(RegionClass::Name, 10.0, 100.0),
            det(RegionClass::Quantity, 300.0, 90.0),
        ];
        let pairs = pair_regions(&detections);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].name.y1, 100.0);
        assert_eq!(pairs[0].quantity.y1, 90.0);
        assert_eq!(pairs[1].name.y1, 210.0);
        assert_eq!(pairs[1].quantity.y1, 200.0);
    }

    #[test]
    fn surplus_detections_are_truncated() {
        let mut detections = (0..5)
            .map(|i| det(RegionClass::Name, 10.0, 500.0 - 100.0 * i as f32))
            .collect::<Vec<_>>();
        detections.extend((0..3).map(|i| det(RegionClass::Quantity, 300.0, 50.0 * i as f32)));
        let pairs = pair_regions(&detections);
        assert_eq!(pairs.len(), 3);
        let name_tops = pairs.iter().map(|p| p.name.y1).collect::<Vec<_>>();
        assert_eq!(name_tops, vec![100.0, 200.0, 300.0]);
        let quantity_tops = pairs.iter().map(|p| p.quantity.y1).collect::<Vec<_>>();
        assert_eq!(quantity_tops, vec![0.0, 50.0, 100.0]);
    }

    #[test]
    fn ties_keep_detection_order_and_results_are_repeatable() {
        let detections = [
            det(RegionClass::Name, 30.0, 100.0),
            det(RegionClass::Name, 10.0, 100.0),
            det(RegionClass::Name, 20.0, 100.0),
            det(RegionClass::Quantity, 300.0, 100.0),
            det(RegionClass::Quantity, 310.0, 100.0),
            det(RegionClass::Quantity, 320.0, 100.0),
        ];
        let pairs = pair_regions(&detections);
        let name_xs = pairs.iter().map(|p| p.name.x1).collect::<Vec<_>>();
        assert_eq!(name_xs, vec![30.0, 10.0, 20.0]);
        let quantity_xs = pairs.iter().map(|p| p.quantity.x1).collect::<Vec<_>>();
        assert_eq!(quantity_xs, vec![300.0, 310.0, 320.0]);
        assert_eq!(pair_regions(&detections), pairs);
    }

    #[test]
    fn no_detections_is_an_empty_page() {
        assert!(pair_regions(&[]).is_empty());
        assert!(pair_regions(&[det(RegionClass::Name, 0.0, 0.0)]).is_empty());
    }
}
