//! Instants and durations
//!
//! The transport layer never reads a clock. The application timestamps
//! received frames and supplies transmission deadlines; timeouts are enforced
//! by comparing those timestamps against each other.

use core::fmt::Debug;

/// A moment in time, as reported by some monotonic clock
pub trait Instant: Debug + Copy + Clone + PartialEq {
    /// The amount of time between two instants
    type Duration: Debug + Clone + PartialOrd;

    /// Returns the time that has passed between an earlier instant and this one
    ///
    /// If `earlier` is actually later than this instant, this function returns
    /// a zero duration.
    fn duration_since(&self, earlier: &Self) -> Self::Duration;
}

impl<const NOM: u32, const DENOM: u32> Instant for fugit::Instant<u32, NOM, DENOM> {
    type Duration = fugit::Duration<u32, NOM, DENOM>;

    fn duration_since(&self, earlier: &Self) -> Self::Duration {
        self.checked_duration_since(*earlier)
            .unwrap_or_else(|| fugit::Duration::<u32, NOM, DENOM>::from_ticks(0))
    }
}

impl<const NOM: u32, const DENOM: u32> Instant for fugit::Instant<u64, NOM, DENOM> {
    type Duration = fugit::Duration<u64, NOM, DENOM>;

    fn duration_since(&self, earlier: &Self) -> Self::Duration {
        self.checked_duration_since(*earlier)
            .unwrap_or_else(|| fugit::Duration::<u64, NOM, DENOM>::from_ticks(0))
    }
}

/// A 32-bit instant with microsecond resolution
///
/// This overflows after about 71 minutes.
pub type Microseconds32 = fugit::TimerInstantU32<1_000_000>;

/// A 64-bit instant with microsecond resolution
pub type Microseconds64 = fugit::TimerInstantU64<1_000_000>;

/// A 32-bit duration with microsecond resolution
pub type MicrosecondDuration32 = fugit::TimerDurationU32<1_000_000>;

/// A 64-bit duration with microsecond resolution
pub type MicrosecondDuration64 = fugit::TimerDurationU64<1_000_000>;
