//! # Utility Functions and Helper Module
//!
//! Small helpers shared across the harness: identifiers for workers and runs,
//! human-readable formatting for the console summary and log lines, settings
//! validators, and plain-text table printing.
//!
//! ## Key Functionality Categories
//!
//! - **Identifiers**: UUID-based worker suffixes and run ids
//! - **Formatting**: Human-readable display of durations and bit rates
//! - **Validation**: Settings validation with clear error messages
//! - **Display Helpers**: Table formatting for the end-of-run summary
//!
//! ## Usage Examples
//!
//! ```rust
//! use streaming_bench::utils::*;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! // Format durations for display
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//!
//! // Throughput is reported in bits per second
//! assert_eq!(format_bits_rate(2_500_000.0), "2.50 Mb/s");
//!
//! validate_message_size(1024)?; // OK
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::time::Duration;
use uuid::Uuid;

/// Largest data-plane message the harness will configure
pub const MAX_MESSAGE_SIZE_LIMIT: usize = 16 * 1024 * 1024;

/// Generate a unique identifier for a benchmark run
///
/// Creates a UUID v4 string recorded in the run metadata so results from
/// separate runs can be told apart even when they share an output directory.
///
/// ## Returns
/// String representation of a UUID v4 (e.g., "550e8400-e29b-41d4-a716-446655440000")
pub fn generate_test_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate the short random suffix of a worker id
///
/// Worker ids take the form `<role>-<suffix>`, e.g. `sender-1a2b3c4d`. Eight
/// hex characters keep log lines readable while making collisions between
/// workers of one run practically impossible.
pub fn generate_worker_suffix() -> String {
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(8);
    suffix
}

/// Format a duration in a human-readable way
///
/// Converts a Duration to a human-readable string, automatically selecting
/// the most appropriate unit based on the magnitude.
///
/// ## Unit Selection Logic
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: For longer durations (e.g., "5m 30s", "2h 15m 30s")
///
/// ## Examples
///
/// ```rust
/// # use streaming_bench::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_secs(330)), "5m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            format!("{}h {}m {}s", minutes / 60, minutes % 60, remaining_seconds)
        }
    }
}

/// Format a throughput given in bits per second
///
/// Network throughput is conventionally quoted in decimal bit rates, so this
/// uses powers of 1000 rather than binary units.
///
/// ## Examples
///
/// ```rust
/// # use streaming_bench::utils::format_bits_rate;
/// assert_eq!(format_bits_rate(800.0), "800 b/s");
/// assert_eq!(format_bits_rate(1_500_000_000.0), "1.50 Gb/s");
/// ```
pub fn format_bits_rate(bits_per_second: f64) -> String {
    if bits_per_second < 1_000.0 {
        format!("{:.0} b/s", bits_per_second)
    } else if bits_per_second < 1_000_000.0 {
        format!("{:.2} Kb/s", bits_per_second / 1_000.0)
    } else if bits_per_second < 1_000_000_000.0 {
        format!("{:.2} Mb/s", bits_per_second / 1_000_000.0)
    } else {
        format!("{:.2} Gb/s", bits_per_second / 1_000_000_000.0)
    }
}

/// Validate a data-plane port number
///
/// Ports below 1024 are privileged on most systems and are refused so that
/// a benchmark never needs elevated permissions. Control ports may be 0
/// (ephemeral) and are checked by the caller before reaching this function.
pub fn validate_port(port: u16) -> Result<()> {
    if port < 1024 {
        anyhow::bail!("Port number {} is too low (below 1024)", port);
    }
    Ok(())
}

/// Validate a message size
///
/// ## Validation Rules
///
/// - **Minimum**: 1 byte; an empty message carries nothing to measure
/// - **Maximum**: 16 MB, the largest data frame a receiver accepts
pub fn validate_message_size(message_size: usize) -> Result<()> {
    if message_size == 0 {
        anyhow::bail!("Message size cannot be zero");
    }
    if message_size > MAX_MESSAGE_SIZE_LIMIT {
        anyhow::bail!("Message size {} is too large (maximum 16MB)", message_size);
    }
    Ok(())
}

/// Validate a test-matrix option list: it must be non-empty and free of zeros
pub fn validate_positive_list<T>(name: &str, values: &[T]) -> Result<()>
where
    T: Copy + Default + PartialEq + std::fmt::Display,
{
    if values.is_empty() {
        anyhow::bail!("The list of {} cannot be empty", name);
    }
    if let Some(zero) = values.iter().find(|v| **v == T::default()) {
        anyhow::bail!("The list of {} contains {}, values must be positive", name, zero);
    }
    Ok(())
}

/// Print a formatted table row
///
/// Outputs one row of an ASCII table with each column padded to its width.
/// Missing widths fall back to 10 characters.
///
/// ## Examples
///
/// ```rust
/// # use streaming_bench::utils::{print_table_row, print_table_separator};
/// let widths = [8, 12];
/// print_table_separator(&widths);
/// print_table_row(&["Case", "Throughput"], &widths);
/// print_table_separator(&widths);
/// ```
pub fn print_table_row(columns: &[&str], widths: &[usize]) {
    print!("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        print!(" {:width$} |", column, width = width);
    }
    println!();
}

/// Print a table separator line matching `widths`
pub fn print_table_separator(widths: &[usize]) {
    print!("+");
    for &width in widths {
        print!("{}+", "-".repeat(width + 2));
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test duration formatting with various time scales
    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.50μs");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    /// Test bit-rate formatting for throughput display
    #[test]
    fn test_format_bits_rate() {
        assert_eq!(format_bits_rate(999.0), "999 b/s");
        assert_eq!(format_bits_rate(1_500.0), "1.50 Kb/s");
        assert_eq!(format_bits_rate(1_500_000.0), "1.50 Mb/s");
        assert_eq!(format_bits_rate(12_000_000_000.0), "12.00 Gb/s");
    }

    #[test]
    fn test_worker_suffix_is_short_and_unique() {
        let a = generate_worker_suffix();
        let b = generate_worker_suffix();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
        assert_ne!(generate_test_id(), generate_test_id());
    }

    /// Test validation functions with valid and invalid inputs
    #[test]
    fn test_validation() {
        assert!(validate_port(6000).is_ok());
        assert!(validate_port(80).is_err());

        assert!(validate_message_size(64).is_ok());
        assert!(validate_message_size(0).is_err());
        assert!(validate_message_size(MAX_MESSAGE_SIZE_LIMIT + 1).is_err());

        assert!(validate_positive_list("sizes", &[64usize, 256]).is_ok());
        assert!(validate_positive_list::<u64>("counts", &[]).is_err());
        assert!(validate_positive_list("counts", &[10u64, 0]).is_err());
    }
}
