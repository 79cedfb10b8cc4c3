use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NANOS_PER_SECOND: i32 = 1_000_000_000;

/// Point in time with nanosecond precision, normalized so `0 <= nanos < 1e9`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        Self {
            seconds: seconds + i64::from(nanos.div_euclid(NANOS_PER_SECOND)),
            nanos: nanos.rem_euclid(NANOS_PER_SECOND),
        }
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(duration) => Self::new(duration.as_secs() as i64, duration.subsec_nanos() as i32),
            Err(err) => {
                let duration = err.duration();
                Self::new(
                    -(duration.as_secs() as i64),
                    -(duration.subsec_nanos() as i32),
                )
            }
        }
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::new(
            micros.div_euclid(1_000_000),
            (micros.rem_euclid(1_000_000) * 1_000) as i32,
        )
    }

    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + i64::from(self.nanos / 1_000)
    }

    pub fn to_system_time(&self) -> SystemTime {
        if self.seconds >= 0 {
            UNIX_EPOCH + Duration::new(self.seconds as u64, self.nanos as u32)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.seconds.unsigned_abs())
                + Duration::from_nanos(self.nanos as u64)
        }
    }

    /// Difference `self - earlier`, saturating at zero.
    pub fn duration_since(&self, earlier: &Timestamp) -> Duration {
        let micros = self.to_micros() - earlier.to_micros();
        Duration::from_micros(micros.max(0) as u64)
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .cmp(&other.seconds)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timestamp(seconds={}, nanos={})", self.seconds, self.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_nanoseconds() {
        let timestamp = Timestamp::new(1, 1_500_000_000);
        assert_eq!(timestamp, Timestamp { seconds: 2, nanos: 500_000_000 });
        let negative = Timestamp::new(1, -1);
        assert_eq!(negative, Timestamp { seconds: 0, nanos: 999_999_999 });
    }

    #[test]
    fn ordering_and_micros() {
        let earlier = Timestamp::new(1, 0);
        let later = Timestamp::from_micros(2_000_001);
        assert!(earlier < later);
        assert_eq!(later.to_micros(), 2_000_001);
        assert_eq!(later.duration_since(&earlier), Duration::from_micros(1_000_001));
        assert_eq!(earlier.duration_since(&later), Duration::ZERO);
    }
}
