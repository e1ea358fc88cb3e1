//! Pure calculation functions for output dimensions.
//!
//! All functions here are pure and testable without any I/O or images.

/// Widths to produce for a task, given the source's intrinsic width.
///
/// Sizes are deduplicated and sorted ascending. Sizes larger than the
/// source are dropped (never upscale). If every requested size exceeds the
/// source, the intrinsic width is returned as the only entry.
///
/// ```
/// # use respimg::imaging::planned_widths;
/// assert_eq!(planned_widths(&[1920, 480, 768], 2000), vec![480, 768, 1920]);
/// assert_eq!(planned_widths(&[480, 768, 1920], 600), vec![480]);
/// assert_eq!(planned_widths(&[480, 768], 300), vec![300]);
/// ```
pub fn planned_widths(sizes: &[u32], intrinsic_width: u32) -> Vec<u32> {
    let mut widths: Vec<u32> = sizes
        .iter()
        .copied()
        .filter(|&w| w > 0 && w <= intrinsic_width)
        .collect();
    widths.sort_unstable();
    widths.dedup();

    if widths.is_empty() && intrinsic_width > 0 {
        widths.push(intrinsic_width);
    }
    widths
}

/// Fixed target height for a width under an optional aspect ratio
/// (`width / height`). `None` means "keep the source proportions".
pub fn target_height(width: u32, aspect_ratio: Option<f64>) -> Option<u32> {
    aspect_ratio
        .filter(|r| r.is_finite() && *r > 0.0)
        .map(|r| ((width as f64 / r).round() as u32).max(1))
}

/// Height that preserves the source aspect ratio at `width`.
pub fn scaled_height(original: (u32, u32), width: u32) -> u32 {
    let (orig_w, orig_h) = original;
    if orig_w == 0 {
        return orig_h;
    }
    ((orig_h as f64 * width as f64 / orig_w as f64).round() as u32).max(1)
}
