pub mod clock {
    //! Process-wide monotonic clock. TSC-backed where the platform
    //! supports it, so hot-path timestamps stay cheap.

    use once_cell::sync::Lazy;
    use quanta::Clock;

    static CLOCK: Lazy<Clock> = Lazy::new(Clock::new);

    /// A precise instant for measuring individual waits and queries.
    #[inline]
    pub fn now() -> quanta::Instant {
        CLOCK.now()
    }

    /// A coarse, cached instant for statistics, where speed matters
    /// more than the last microsecond.
    #[inline]
    pub fn recent() -> quanta::Instant {
        CLOCK.recent()
    }
}
