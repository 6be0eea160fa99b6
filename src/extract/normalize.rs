//! Clean up recognized text.

/// Characters recognizers commonly produce where item codes contain a zero.
const ZERO_LOOKALIKES: [char; 4] = ['O', 'o', 'Ｏ', 'ｏ'];

/// Item codes contain zeros, never the letter O, so map every letter O
/// (ASCII or full-width, either case) to `0` and strip all whitespace.
pub fn normalize_item_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if ZERO_LOOKALIKES.contains(&c) { '0' } else { c })
        .collect()
}

/// Strip all whitespace, leaving everything else untouched.
pub fn normalize_quantity(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}
