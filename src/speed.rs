//! Speed from authoritative distance.
//!
//! GPS fixes only provide the clock. The distance term is always the
//! surveyed length of the master route (or leg), never the length
//! integrated along the noisy sub-track.

/// Meters per second to kilometers per hour.
pub const MPS_TO_KMH: f64 = 3.6;

/// Speed in km/h over `distance_m` meters covered in `elapsed_seconds`.
///
/// Returns 0 when the elapsed time is not positive. Such a value marks a
/// degenerate observation, not a stationary vehicle.
///
/// # Example
/// ```
/// use tramify::calculate_speed;
/// assert_eq!(calculate_speed(1000.0, 100.0), 36.0);
/// assert_eq!(calculate_speed(1000.0, 0.0), 0.0);
/// ```
pub fn calculate_speed(distance_m: f64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds <= 0.0 || elapsed_seconds.is_nan() {
        return 0.0;
    }
    (distance_m / elapsed_seconds) * MPS_TO_KMH
}

/// Format a travel time as `M:SS`.
///
/// Minutes are not wrapped into hours, so 3725 s is `62:05`.
pub fn format_travel_time(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    format!("{}:{:02}", total / 60, total % 60)
}
