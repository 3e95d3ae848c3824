// Stopwatch used to time transfers.
//
// A stopwatch only looks at its clock when it is started, stopped, or read, so it costs nothing
// while it is running. It supports any number of start/stop pairs; the intervals accumulate until
// the stopwatch is reset.

use std::time::Duration;
use tokio::time::Instant;

/// A source of "now". Shared stopwatch logic only ever talks to this trait.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The host's monotonic clock, as exposed by tokio. The platform-specific implementation is picked
/// when the standard library is built, and tests can pause or advance it through tokio's
/// `test-util` feature.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopwatchState {
    /// No time accumulated and not keeping time.
    Reset,
    /// Keeping time since the given mark.
    Running(Instant),
    /// Not keeping time; accumulated time is remembered.
    Stopped,
}

#[derive(Debug)]
pub struct Stopwatch<C = MonotonicClock> {
    clock: C,
    state: StopwatchState,
    accumulated: Duration,
}

impl Stopwatch<MonotonicClock> {
    pub fn new() -> Self {
        Stopwatch::with_clock(MonotonicClock)
    }
}

impl Default for Stopwatch<MonotonicClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Stopwatch<C> {
    pub fn with_clock(clock: C) -> Self {
        Stopwatch {
            clock,
            state: StopwatchState::Reset,
            accumulated: Duration::ZERO,
        }
    }

    /// Erases the accumulated time and puts the stopwatch back into its initial state.
    pub fn reset(&mut self) {
        self.state = StopwatchState::Reset;
        self.accumulated = Duration::ZERO;
    }

    /// Starts timing. Starting a running stopwatch replaces its mark, so the unfinished interval
    /// is dropped while the accumulated time stays as it was.
    pub fn start(&mut self) {
        self.state = StopwatchState::Running(self.clock.now());
    }

    /// Stops timing and folds the current interval into the accumulated time. A stopwatch that
    /// isn't running has no interval to fold in.
    pub fn stop(&mut self) {
        if let StopwatchState::Running(mark) = self.state {
            self.accumulated += self.clock.now().saturating_duration_since(mark);
        }
        self.state = StopwatchState::Stopped;
    }

    pub fn state(&self) -> StopwatchState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, StopwatchState::Running(_))
    }

    pub fn elapsed(&self) -> Duration {
        match self.state {
            StopwatchState::Running(mark) => {
                self.accumulated + self.clock.now().saturating_duration_since(mark)
            }
            StopwatchState::Reset | StopwatchState::Stopped => self.accumulated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_new_stopwatch_is_reset() {
        let watch = Stopwatch::new();
        assert_eq!(watch.state(), StopwatchState::Reset);
        assert_eq!(watch.elapsed(), Duration::ZERO);
        advance(Duration::from_millis(50)).await;
        assert_eq!(watch.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_interval() {
        let mut watch = Stopwatch::new();
        watch.start();
        advance(Duration::from_millis(250)).await;
        watch.stop();
        assert_eq!(watch.state(), StopwatchState::Stopped);
        assert_eq!(watch.elapsed(), Duration::from_millis(250));

        // Time passing while stopped is not counted.
        advance(Duration::from_millis(100)).await;
        assert_eq!(watch.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_intervals_accumulate() {
        let mut watch = Stopwatch::new();
        for ms in [10, 20, 30] {
            watch.start();
            advance(Duration::from_millis(ms)).await;
            watch.stop();
            advance(Duration::from_millis(1000)).await;
        }
        assert_eq!(watch.elapsed(), Duration::from_millis(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reading_while_running_does_not_mutate() {
        let mut watch = Stopwatch::new();
        watch.start();
        advance(Duration::from_millis(40)).await;
        let first = watch.elapsed();
        advance(Duration::from_millis(40)).await;
        let second = watch.elapsed();

        assert_eq!(first, Duration::from_millis(40));
        assert_eq!(second, Duration::from_millis(80));
        assert!(watch.is_running());

        watch.stop();
        assert_eq!(watch.elapsed(), Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_drops_unfinished_interval() {
        let mut watch = Stopwatch::new();
        watch.start();
        advance(Duration::from_millis(30)).await;
        watch.stop();

        watch.start();
        advance(Duration::from_millis(500)).await;
        // Retriggered: the 500ms above are lost, the 30ms accumulated earlier are not.
        watch.start();
        advance(Duration::from_millis(5)).await;
        watch.stop();

        assert_eq!(watch.elapsed(), Duration::from_millis(35));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_accumulated_time() {
        let mut watch = Stopwatch::new();
        watch.start();
        advance(Duration::from_millis(30)).await;
        watch.reset();
        assert_eq!(watch.state(), StopwatchState::Reset);
        assert_eq!(watch.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_start_accumulates_nothing() {
        let mut watch = Stopwatch::new();
        advance(Duration::from_millis(30)).await;
        watch.stop();
        assert_eq!(watch.state(), StopwatchState::Stopped);
        assert_eq!(watch.elapsed(), Duration::ZERO);
    }

    struct FixedClock(Instant);

    impl Clock for FixedClock {
        fn now(&self) -> Instant {
            self.0
        }
    }

    #[test]
    fn test_custom_clock() {
        let mut watch = Stopwatch::with_clock(FixedClock(Instant::now()));
        watch.start();
        watch.stop();
        assert_eq!(watch.elapsed(), Duration::ZERO);
    }
}
