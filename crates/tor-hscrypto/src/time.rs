//! Manipulate time periods (as used in the onion service system)

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tor_units::IntegerMinutes;

/// An error that occurred while constructing or manipulating a [`TimePeriod`].
#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum TimePeriodError {
    /// The given length was zero, or could not be represented in seconds.
    #[error("Invalid time period length")]
    InvalidLength,
    /// The given time could not be represented relative to the unix epoch.
    #[error("Time could not be represented as a duration since the unix epoch")]
    TimeOutOfRange,
}

/// A period of time as used in the onion service system.
///
/// These time periods are used to derive a different `HsBlindIdKey`
/// during each period from each `HsIdKey`.
///
/// Each time period is defined by its length and a voting offset: time
/// period number `n` begins at `n * length + voting_offset` seconds after
/// the unix epoch, per rend-spec-v3 section 2.2.1.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimePeriod {
    /// Index of the time periods that have passed since the unix epoch.
    interval_num: u64,
    /// The length of a time period, in seconds.
    length_in_sec: u32,
}

impl TimePeriod {
    /// Construct a time period of a given `length` that contains `when`.
    ///
    /// The `voting_offset` is subtracted from `when` (and added back when
    /// computing a period's boundaries); it exists because the directory
    /// authorities do not start a new time period at the moment consensus
    /// voting begins, but rather `voting_offset` after that moment. See
    /// rend-spec-v3 section 2.2.1 for more information.
    pub fn new(
        length: Duration,
        when: SystemTime,
        voting_offset: Duration,
    ) -> Result<Self, TimePeriodError> {
        let length_in_sec: u32 = length
            .as_secs()
            .try_into()
            .map_err(|_| TimePeriodError::InvalidLength)?;
        if length_in_sec == 0 {
            return Err(TimePeriodError::InvalidLength);
        }
        let since_epoch = when
            .duration_since(UNIX_EPOCH)
            .map_err(|_| TimePeriodError::TimeOutOfRange)?;
        let offset_sec = voting_offset.as_secs();
        let adjusted = since_epoch
            .as_secs()
            .checked_sub(offset_sec)
            .ok_or(TimePeriodError::TimeOutOfRange)?;
        let interval_num = adjusted / u64::from(length_in_sec);
        Ok(TimePeriod {
            interval_num,
            length_in_sec,
        })
    }

    /// Return the index of this time period since the unix epoch.
    pub fn interval_num(&self) -> u64 {
        self.interval_num
    }

    /// Return the length of this time period.
    pub fn length(&self) -> IntegerMinutes<u32> {
        IntegerMinutes::new(self.length_in_sec / 60)
    }

    /// Return the time period after this one.
    ///
    /// Return None if this is the last representable time period.
    pub fn next(&self) -> Option<Self> {
        Some(TimePeriod {
            interval_num: self.interval_num.checked_add(1)?,
            length_in_sec: self.length_in_sec,
        })
    }

    /// Return the time period after this one.
    ///
    /// Return None if this is the first representable time period.
    pub fn prev(&self) -> Option<Self> {
        Some(TimePeriod {
            interval_num: self.interval_num.checked_sub(1)?,
            length_in_sec: self.length_in_sec,
        })
    }

    /// Return true if this time period contains `when`.
    ///
    /// Note that this does not account for the voting offset used to
    /// construct this time period; it simply asks whether `when` falls
    /// within the nominal interval `[interval_num, interval_num+1) *
    /// length`.
    pub fn contains(&self, when: SystemTime) -> bool {
        match self.range() {
            Some(range) => range.contains(&when),
            None => false,
        }
    }

    /// Return a range representing the [`SystemTime`] values contained within
    /// this time period.
    ///
    /// Return None if this time period contains no times that can be
    /// represented as a `SystemTime`.
    pub fn range(&self) -> Option<std::ops::Range<SystemTime>> {
        let start_sec = self.interval_num.checked_mul(u64::from(self.length_in_sec))?;
        let end_sec = start_sec.checked_add(u64::from(self.length_in_sec))?;
        let start = UNIX_EPOCH.checked_add(Duration::from_secs(start_sec))?;
        let end = UNIX_EPOCH.checked_add(Duration::from_secs(end_sec))?;
        Some(start..end)
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;

    #[test]
    fn interval_num_matches_known_vector() {
        // From C Tor's test_hs_common.c:test_hs_indexes, converted to our API.
        let period = TimePeriod::new(
            Duration::from_secs(24 * 3600),
            UNIX_EPOCH + Duration::from_secs(3_718_800),
            Duration::from_secs(12 * 3600),
        )
        .unwrap();
        assert_eq!(period.interval_num(), 42);
    }

    #[test]
    fn next_and_prev() {
        let period = TimePeriod::new(
            Duration::from_secs(24 * 3600),
            UNIX_EPOCH + Duration::from_secs(3_718_800),
            Duration::from_secs(12 * 3600),
        )
        .unwrap();
        assert_eq!(period.next().unwrap().interval_num(), 43);
        assert_eq!(period.prev().unwrap().interval_num(), 41);
        assert_eq!(period.next().unwrap().prev().unwrap(), period);
    }

    #[test]
    fn range_contains_self() {
        let when = UNIX_EPOCH + Duration::from_secs(3_718_800);
        let period =
            TimePeriod::new(Duration::from_secs(24 * 3600), when, Duration::from_secs(12 * 3600))
                .unwrap();
        assert!(period.contains(when));
        assert!(!period.contains(when - Duration::from_secs(999_999)));
    }

    #[test]
    fn rejects_zero_length() {
        assert!(TimePeriod::new(Duration::from_secs(0), UNIX_EPOCH, Duration::from_secs(0)).is_err());
    }
}
