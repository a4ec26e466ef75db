//! Window identity and bucket arithmetic.
//!
//! Time is divided into fixed-width windows of [`Width`] seconds. Window `b`
//! covers the half-open interval `[b * width, (b + 1) * width)`, so the bucket
//! of a timestamp is its floored quotient. Floor, not truncation: timestamp
//! `-1` belongs to bucket `-1`, not bucket `0`.

/// Errors produced when constructing a [`Width`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A window must be at least one second wide.
    #[error("window width must be greater than zero")]
    Zero,
    /// The width does not fit the signed timestamp domain.
    #[error("window width of {0} seconds is too large")]
    TooLarge(u64),
}

/// The width of a window in seconds. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Width(i64);

impl Width {
    /// Create a new `Width` of `secs` seconds.
    ///
    /// # Errors
    ///
    /// Returns an error if `secs` is zero or exceeds `i64::MAX`.
    pub fn from_secs(secs: u64) -> Result<Self, Error> {
        if secs == 0 {
            return Err(Error::Zero);
        }
        let secs = i64::try_from(secs).map_err(|_| Error::TooLarge(secs))?;
        Ok(Self(secs))
    }

    /// Width in seconds.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn as_secs(self) -> u64 {
        self.0 as u64
    }

    /// The bucket containing `timestamp`.
    #[inline]
    #[must_use]
    pub fn bucket(self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.0)
    }

    /// The first bucket whose window starts at or after `timestamp`.
    ///
    /// Every bucket strictly less than the returned value starts strictly
    /// before `timestamp`.
    #[inline]
    #[must_use]
    pub fn bucket_at_or_after(self, timestamp: i64) -> i64 {
        let floor = timestamp.div_euclid(self.0);
        if timestamp.rem_euclid(self.0) == 0 {
            floor
        } else {
            floor + 1
        }
    }

    /// The timestamp at which `bucket` starts.
    #[inline]
    #[must_use]
    pub fn start(self, bucket: i64) -> i64 {
        bucket.saturating_mul(self.0)
    }
}

/// Identity of a single accumulation window: a metric path and the bucket
/// its samples fall in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    /// The metric path, as received.
    pub path: String,
    /// The bucket number, `floor(timestamp / width)`.
    pub bucket: i64,
}

impl WindowKey {
    /// The key for a sample of `path` observed at `timestamp`.
    #[must_use]
    pub fn new(path: &str, timestamp: i64, width: Width) -> Self {
        Self {
            path: path.to_string(),
            bucket: width.bucket(timestamp),
        }
    }
}
