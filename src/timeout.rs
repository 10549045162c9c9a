//! The client-side deadline model.
//!
//! Two incompatible timeout modes exist: the legacy per-phase budgets
//! (`serverSelectionTimeoutMS`, `waitQueueTimeoutMS`, `socketTimeoutMS`) and the
//! client-side operation timeout (`timeoutMS`, "CSOT"), a single overall
//! deadline shared by every phase of one logical operation. A
//! [`TimeoutContext`] is created once per top-level call (or inherited from an
//! active session-level context during transaction commit/abort) and discarded
//! at call completion.

use std::time::{Duration, Instant};

use crate::{
    error::{Error, ErrorKind},
    options::ClientOptions,
};

/// The default amount of time to wait for a server to be selected.
pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// A single-shot deadline timer.
///
/// A `Timeout` is either pending or permanently expired; it never "resolves
/// successfully". Awaiting [`expired`](Timeout::expired) yields the expiry
/// error once the deadline passes, which makes it suitable as the losing arm
/// of a `select!`.
#[derive(Clone, Debug)]
pub struct Timeout {
    start: Instant,
    duration: Duration,
    cleared: bool,
}

impl Timeout {
    /// Creates a timer expiring `duration` from now. A zero duration yields an
    /// already-expired timer.
    pub fn expires_in(duration: Duration) -> Self {
        Self {
            start: Instant::now(),
            duration,
            cleared: false,
        }
    }

    /// The total duration of this timer.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The time elapsed since this timer was started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// The time remaining until this timer expires, clamped to zero.
    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.elapsed())
    }

    /// Whether this timer has expired. A cleared timer never expires.
    pub fn is_expired(&self) -> bool {
        !self.cleared && self.remaining() == Duration::ZERO
    }

    /// Waits until this timer expires and returns the expiry error. A cleared
    /// timer pends forever.
    pub async fn expired(&self) -> Error {
        if self.cleared {
            return std::future::pending().await;
        }
        tokio::time::sleep(self.remaining()).await;
        self.expiry_error()
    }

    /// Permanently disarms this timer. Idempotent.
    pub fn clear(&mut self) {
        self.cleared = true;
    }

    pub(crate) fn expiry_error(&self) -> Error {
        Error::network_timeout(format!(
            "operation exceeded its {:?} time budget",
            self.duration
        ))
    }
}

/// Computes per-phase or overall time budgets for one logical operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum TimeoutContext {
    /// Independent budgets for server selection, connection checkout, and socket operations.
    Legacy(LegacyTimeoutContext),

    /// A single overall deadline (`timeoutMS`) shared by every phase.
    Csot(CsotTimeoutContext),
}

/// The legacy per-phase budgets.
#[derive(Clone, Debug)]
pub struct LegacyTimeoutContext {
    server_selection_timeout: Duration,
    wait_queue_timeout: Option<Duration>,
    socket_timeout: Option<Duration>,
}

/// The overall-deadline (`timeoutMS`) budget.
#[derive(Clone, Debug)]
pub struct CsotTimeoutContext {
    /// The configured overall budget. A zero duration disables the deadline.
    timeout: Duration,
    start: Instant,
    min_round_trip_time: Duration,
    server_selection_timeout: Duration,
    /// Memoized so that connection checkout shares the server selection timer
    /// rather than restarting the clock.
    selection_timer: Option<Timeout>,
}

impl TimeoutContext {
    /// Derives a context from client options: CSOT when `timeout` is configured, legacy
    /// per-phase budgets otherwise.
    pub fn from_options(options: &ClientOptions) -> Self {
        let server_selection_timeout = options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);
        match options.timeout {
            Some(timeout) => Self::Csot(CsotTimeoutContext {
                timeout,
                start: Instant::now(),
                min_round_trip_time: Duration::ZERO,
                server_selection_timeout,
                selection_timer: None,
            }),
            None => Self::Legacy(LegacyTimeoutContext {
                server_selection_timeout,
                wait_queue_timeout: options.wait_queue_timeout,
                socket_timeout: options.socket_timeout,
            }),
        }
    }

    /// Whether an overall deadline is active.
    pub fn is_csot(&self) -> bool {
        match self {
            Self::Csot(ctx) => !ctx.timeout.is_zero(),
            Self::Legacy(_) => false,
        }
    }

    /// The time remaining under the overall deadline, clamped to zero. `None` when no overall
    /// deadline is active.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Csot(ctx) if !ctx.timeout.is_zero() => {
                Some(ctx.timeout.saturating_sub(ctx.start.elapsed()))
            }
            _ => None,
        }
    }

    /// Whether the overall deadline has passed. Expiry is a boolean; the remaining time is never
    /// reported as a negative duration.
    pub fn is_expired(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
    }

    /// The timer bounding server selection: the configured server selection budget under legacy
    /// timeouts, or whichever is smaller of that budget and the remaining overall time under
    /// CSOT. Computed once per context and memoized.
    pub fn server_selection_timeout(&mut self) -> Timeout {
        match self {
            Self::Legacy(ctx) => Timeout::expires_in(ctx.server_selection_timeout),
            Self::Csot(ctx) => ctx.selection_timer(),
        }
    }

    /// The timer bounding connection checkout. Under CSOT this is the same timer as server
    /// selection, so waiting in the connection wait queue does not restart the clock.
    pub fn connection_checkout_timeout(&mut self) -> Option<Timeout> {
        match self {
            Self::Legacy(ctx) => ctx.wait_queue_timeout.map(Timeout::expires_in),
            Self::Csot(ctx) => Some(ctx.selection_timer()),
        }
    }

    /// The budget to apply to a single network round trip: the remaining overall time under
    /// CSOT, the static socket timeout otherwise.
    pub fn socket_budget(&self) -> Option<Duration> {
        match self {
            Self::Legacy(ctx) => ctx.socket_timeout,
            Self::Csot(_) => self.remaining(),
        }
    }

    /// The `maxTimeMS` value to attach to an outgoing command: the remaining overall time less
    /// the server's minimum round trip time. `None` when no overall deadline is active or the
    /// correction leaves no time to request.
    pub fn max_time_ms(&self) -> Option<Duration> {
        match self {
            Self::Csot(ctx) => {
                let remaining = self.remaining()?;
                let max_time = remaining.saturating_sub(ctx.min_round_trip_time);
                (!max_time.is_zero()).then_some(max_time)
            }
            Self::Legacy(_) => None,
        }
    }

    /// Records the `minRoundTripTime` correction used by [`max_time_ms`](Self::max_time_ms).
    pub fn set_min_round_trip_time(&mut self, rtt: Duration) {
        if let Self::Csot(ctx) = self {
            ctx.min_round_trip_time = rtt;
        }
    }

    /// Resets the start instant and round trip correction and clears any memoized sub-timers.
    /// Used when a cursor's iteration mode treats each `getMore` as a fresh deadline rather than
    /// sharing the cursor's lifetime budget.
    pub fn refresh(&mut self) {
        if let Self::Csot(ctx) = self {
            ctx.start = Instant::now();
            ctx.min_round_trip_time = Duration::ZERO;
            ctx.selection_timer = None;
        }
    }

    /// Drops memoized sub-timers so the next attempt computes fresh phase budgets from the
    /// remaining overall time. The start instant is unchanged.
    pub(crate) fn clear_transient(&mut self) {
        if let Self::Csot(ctx) = self {
            ctx.selection_timer = None;
        }
    }

    pub(crate) fn expiry_error(&self) -> Error {
        match self {
            Self::Csot(ctx) => Error::network_timeout(format!(
                "operation exceeded the overall timeoutMS budget of {:?}",
                ctx.timeout
            )),
            Self::Legacy(_) => ErrorKind::NetworkTimeout {
                message: "operation timed out".to_string(),
            }
            .into(),
        }
    }
}

impl CsotTimeoutContext {
    fn selection_timer(&mut self) -> Timeout {
        if let Some(ref timer) = self.selection_timer {
            return timer.clone();
        }
        let remaining = self.timeout.saturating_sub(self.start.elapsed());
        let duration = if self.timeout.is_zero() {
            // Deadline disabled; only the configured selection budget applies.
            self.server_selection_timeout
        } else {
            self.server_selection_timeout.min(remaining)
        };
        let timer = Timeout::expires_in(duration);
        self.selection_timer = Some(timer.clone());
        timer
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::ClientOptions;

    fn csot_options(timeout: Duration, selection: Duration) -> ClientOptions {
        ClientOptions::builder()
            .timeout(timeout)
            .server_selection_timeout(selection)
            .build()
    }

    #[test]
    fn overall_deadline_caps_server_selection() {
        let mut ctx = TimeoutContext::from_options(&csot_options(
            Duration::from_millis(500),
            Duration::from_secs(30),
        ));
        let timer = ctx.server_selection_timeout();
        assert!(timer.duration() <= Duration::from_millis(500));
    }

    #[test]
    fn connection_checkout_shares_selection_timer() {
        let mut ctx = TimeoutContext::from_options(&csot_options(
            Duration::from_millis(500),
            Duration::from_secs(30),
        ));
        let selection = ctx.server_selection_timeout();
        let checkout = ctx.connection_checkout_timeout().unwrap();
        assert_eq!(selection.start, checkout.start);
        assert_eq!(selection.duration(), checkout.duration());
    }

    #[test]
    fn remaining_is_monotone_and_non_negative() {
        let ctx = TimeoutContext::from_options(&csot_options(
            Duration::from_millis(50),
            Duration::from_secs(30),
        ));
        let first = ctx.remaining().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let second = ctx.remaining().unwrap();
        assert!(second <= first);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
        assert!(ctx.is_expired());
    }

    #[test]
    fn zero_timeout_disables_the_deadline() {
        let ctx = TimeoutContext::from_options(&csot_options(
            Duration::ZERO,
            Duration::from_secs(30),
        ));
        assert!(!ctx.is_csot());
        assert_eq!(ctx.remaining(), None);
        assert!(!ctx.is_expired());
        assert_eq!(ctx.max_time_ms(), None);
    }

    #[test]
    fn max_time_ms_subtracts_round_trip_correction() {
        let mut ctx = TimeoutContext::from_options(&csot_options(
            Duration::from_millis(500),
            Duration::from_secs(30),
        ));
        ctx.set_min_round_trip_time(Duration::from_millis(100));
        let max_time = ctx.max_time_ms().unwrap();
        assert!(max_time <= Duration::from_millis(400));

        // Corrections that consume the whole budget omit maxTimeMS entirely.
        ctx.set_min_round_trip_time(Duration::from_secs(2));
        assert_eq!(ctx.max_time_ms(), None);
    }

    #[test]
    fn refresh_restarts_the_clock() {
        let mut ctx = TimeoutContext::from_options(&csot_options(
            Duration::from_millis(40),
            Duration::from_secs(30),
        ));
        std::thread::sleep(Duration::from_millis(45));
        assert!(ctx.is_expired());
        ctx.refresh();
        assert!(!ctx.is_expired());
        assert!(ctx.remaining().unwrap() > Duration::from_millis(30));
    }

    #[test]
    fn zero_duration_timer_is_born_expired() {
        let timer = Timeout::expires_in(Duration::ZERO);
        assert!(timer.is_expired());
        assert_eq!(timer.remaining(), Duration::ZERO);
    }

    #[test]
    fn cleared_timer_never_expires() {
        let mut timer = Timeout::expires_in(Duration::ZERO);
        timer.clear();
        timer.clear();
        assert!(!timer.is_expired());
    }
}
