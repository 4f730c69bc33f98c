//! Production output prediction.

/// Fraction of a production run expected to be defective.
const DEFECTIVE_RATE: f64 = 0.3;

/// Fraction of defective units that inspection actually finds.
const FOUND_RATE: f64 = 0.06;

/// Predict the size of a production run from the number of defects found
/// during inspection.
///
/// Inverts the sampling chain: inspection catches `FOUND_RATE` of the
/// `DEFECTIVE_RATE` share of the run, so the run size is
/// `found_defects / (DEFECTIVE_RATE * FOUND_RATE)`. The quotient is
/// truncated to a whole number of units (never rounded up) and rendered
/// with the localized unit suffix.
pub fn predict_output(found_defects: i64) -> String {
    let output = found_defects as f64 / (DEFECTIVE_RATE * FOUND_RATE);
    let units = if output < 0.0 { 0 } else { output as i64 };
    format!("{} шт.", units)
}
