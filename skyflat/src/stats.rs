//! Frame statistics

use crate::device_ops::ImageData;

/// Arithmetic mean of all pixels.
///
/// No outlier rejection: stars and hot pixels bias the level slightly high.
/// Returns `None` for an empty frame.
pub fn mean_sky_level(image: &ImageData) -> Option<f64> {
    if image.data.is_empty() {
        return None;
    }
    let sum: f64 = image.data.iter().map(|&v| v as f64).sum();
    let mean = sum / image.data.len() as f64;

    tracing::debug!(
        "Mean sky level {:.1} over {} pixels ({}x{})",
        mean,
        image.data.len(),
        image.width,
        image.height
    );
    Some(mean)
}
