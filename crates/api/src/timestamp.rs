/// rdsys timestamp.
///
/// Internally i64 microseconds from unix epoch. This is the only time
/// representation that crosses module boundaries; human rendering is
/// left to the presentation layer.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Construct a new timestamp of "now".
    pub fn now() -> Self {
        std::time::SystemTime::now().into()
    }

    /// Construct a timestamp from i64 microseconds since unix epoch.
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Get the i64 microseconds since unix epoch.
    pub fn as_micros(&self) -> i64 {
        self.0
    }

    /// The duration elapsed between this timestamp and "now".
    /// Saturates to zero if this timestamp lies in the future.
    pub fn elapsed(&self) -> std::time::Duration {
        Timestamp::now().saturating_since(*self)
    }

    /// The duration elapsed since the given earlier timestamp,
    /// saturating to zero if `earlier` is actually later.
    pub fn saturating_since(&self, earlier: Timestamp) -> std::time::Duration {
        if self.0 <= earlier.0 {
            std::time::Duration::ZERO
        } else {
            std::time::Duration::from_micros((self.0 - earlier.0) as u64)
        }
    }
}

impl std::ops::Add<std::time::Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: std::time::Duration) -> Self::Output {
        Timestamp(self.0 + rhs.as_micros() as i64)
    }
}

impl std::ops::Sub<std::time::Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: std::time::Duration) -> Self::Output {
        Timestamp(self.0 - rhs.as_micros() as i64)
    }
}

impl From<std::time::SystemTime> for Timestamp {
    fn from(t: std::time::SystemTime) -> Self {
        Self(
            t.duration_since(std::time::SystemTime::UNIX_EPOCH)
                .expect("invalid system time")
                .as_micros() as i64,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timestamp_ordering() {
        let a = Timestamp::from_micros(10);
        let b = Timestamp::from_micros(20);
        assert!(a < b);
        assert_eq!(
            std::time::Duration::from_micros(10),
            b.saturating_since(a)
        );
        assert_eq!(std::time::Duration::ZERO, a.saturating_since(b));
    }

    #[test]
    fn timestamp_arithmetic() {
        let a = Timestamp::from_micros(500);
        let d = std::time::Duration::from_micros(100);
        assert_eq!(Timestamp::from_micros(600), a + d);
        assert_eq!(Timestamp::from_micros(400), a - d);
    }

    #[test]
    fn timestamp_serde_transparent() {
        let a = Timestamp::from_micros(42);
        assert_eq!("42", serde_json::to_string(&a).unwrap());
        let b: Timestamp = serde_json::from_str("42").unwrap();
        assert_eq!(a, b);
    }
}
