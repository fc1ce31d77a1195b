//! Millisecond wall-clock helpers.

use chrono::Utc;

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_epoch_scale() {
        // Sometime after 2020-01-01 and below the year-10000 mark.
        let now = now_ms();
        assert!(now > 1_577_836_800_000);
        assert!(now < 253_402_300_800_000);
    }
}
