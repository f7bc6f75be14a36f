// =============================================================================
// KRX market hours — Asia/Seoul trading window check
// =============================================================================

use chrono::{DateTime, FixedOffset, Timelike, Utc};

/// Seoul is UTC+9 year-round (no DST).
fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("fixed KST offset is valid")
}

/// Regular KRX session: [09:00, 15:30) KST.
pub fn is_market_open_at(now: DateTime<Utc>) -> bool {
    let seoul = now.with_timezone(&kst());
    let minutes = seoul.hour() * 60 + seoul.minute();
    (9 * 60..15 * 60 + 30).contains(&minutes)
}

pub fn is_market_open() -> bool {
    is_market_open_at(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        // 2025-03-03 is a Monday.
        Utc.with_ymd_and_hms(2025, 3, 3, h, m, 0).unwrap()
    }

    #[test]
    fn open_at_session_start() {
        // 09:00 KST == 00:00 UTC.
        assert!(is_market_open_at(utc(0, 0)));
    }

    #[test]
    fn open_mid_session() {
        // 13:00 KST == 04:00 UTC.
        assert!(is_market_open_at(utc(4, 0)));
    }

    #[test]
    fn closed_at_close_boundary() {
        // 15:30 KST == 06:30 UTC — the window is half-open.
        assert!(!is_market_open_at(utc(6, 30)));
        assert!(is_market_open_at(utc(6, 29)));
    }

    #[test]
    fn closed_before_open() {
        // 08:59 KST == 23:59 UTC previous day.
        assert!(!is_market_open_at(
            Utc.with_ymd_and_hms(2025, 3, 2, 23, 59, 0).unwrap()
        ));
    }
}
