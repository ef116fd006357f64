pub mod controller;
pub mod header_times;
pub mod log_streamer;

pub use controller::{JobController, JobOutcome, validate_env};
pub use header_times::HeaderScanner;
pub use log_streamer::LogStreamer;

use chrono::{DateTime, SecondsFormat, Utc};

/// Wire timestamp format: RFC 3339 with nanoseconds, UTC.
pub fn rfc3339_nanos(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn timestamps_carry_nanoseconds_and_utc_suffix() {
        let t = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
            + chrono::Duration::nanoseconds(6);
        assert_eq!(rfc3339_nanos(t), "2026-01-02T03:04:05.000000006Z");
    }
}
