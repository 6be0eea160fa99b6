//! Map text recognized on a composite back to the pair it came from.

use super::{compositor::PairBounds, geometry::BoundingBox};
use crate::prelude::*;

/// A piece of text found by a recognizer, with its position in the
/// recognized image.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub text: String,
    pub bbox: BoundingBox,
}

impl Token {
    pub fn new(text: impl Into<String>, bbox: BoundingBox) -> Self {
        Self {
            text: text.into(),
            bbox,
        }
    }
}

/// Which half of a pair a token belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    Name,
    Quantity,
}

/// Raw text for one pair, before normalization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PairText {
    pub name: String,
    pub quantity: String,
}

/// Result of assigning the tokens of one composite.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reattribution {
    /// One entry per pair bounds, in the same order.
    pub fields: Vec<PairText>,
    /// Tokens whose center fell outside every pair, such as in the padding
    /// between two pairs.
    pub dropped: usize,
}

/// Find the pair and field containing a vertical position.
///
/// Ranges are closed, and the first matching pair wins. Positions above
/// `split_y` are names and everything from `split_y` down is a quantity.
pub fn locate(bounds: &[PairBounds], center_y: f32) -> Option<(usize, Field)> {
    bounds.iter().enumerate().find_map(|(idx, b)| {
        if b.top as f32 <= center_y && center_y <= b.bottom as f32 {
            let field = if center_y < b.split_y as f32 {
                Field::Name
            } else {
                Field::Quantity
            };
            Some((idx, field))
        } else {
            None
        }
    })
}

/// Concatenate token text per pair and field, keeping the order in which the
/// recognizer returned the tokens.
pub fn reattribute(tokens: &[Token], bounds: &[PairBounds]) -> Reattribution {
    let mut result = Reattribution {
        fields: vec![PairText::default(); bounds.len()],
        dropped: 0,
    };
    for token in tokens {
        let center_y = token.bbox.center_y();
        match locate(bounds, center_y) {
            Some((idx, Field::Name)) => result.fields[idx].name.push_str(&token.text),
            Some((idx, Field::Quantity)) => {
                result.fields[idx].quantity.push_str(&token.text)
            }
            None => {
                debug!(text = %token.text, center_y, "Dropping token outside every pair");
                result.dropped += 1;
            }
        }
    }
    result
}
