use core::time::Duration;

/// Relative position of two instants, taking into account that the
/// underlying counter may have wrapped between the two reads.
pub enum TimeDiff {
    Forward(Duration),
    Backward(Duration),
}

/// A monotonic time source with an opaque instant type.
///
/// The driver only ever needs to measure how much time has passed since
/// a point it captured itself, so the trait is deliberately limited to
/// instant capture and instant subtraction. How an instant maps to a
/// hardware counter is up to the implementation.
pub trait Clock {
    type TInstant: Copy;

    fn current_instant(&self) -> Self::TInstant;

    /// Reliably calculates the direction of time between two instants,
    /// taking into account limitations of the underlying counter (e.g.
    /// a 32 bit cycle counter that wraps every few seconds).
    fn diff(&self, newer: Self::TInstant, older: Self::TInstant) -> TimeDiff;

    /// Time elapsed since `older` was captured. An apparent backwards
    /// step reads as zero rather than a huge forward jump.
    fn elapsed_since(&self, older: Self::TInstant) -> Duration {
        match self.diff(self.current_instant(), older) {
            TimeDiff::Forward(d) => d,
            TimeDiff::Backward(_) => Duration::ZERO,
        }
    }
}
