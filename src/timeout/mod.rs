//! Timeout management
//!
//! A stack of running runnables sharing one countdown. Elapsed time is
//! charged to the slot of the innermost runnable (or fixture) that owns one,
//! falling back to the test's default slot.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::models::Location;

/// A time budget shared by every runnable charged to it.
#[derive(Clone, Debug)]
pub struct TimeSlot {
    inner: Arc<Mutex<SlotState>>,
}

#[derive(Debug)]
struct SlotState {
    timeout_ms: u64,
    elapsed_ms: u64,
}

impl TimeSlot {
    /// A slot with `timeout_ms` of budget; zero means unlimited.
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlotState {
                timeout_ms,
                elapsed_ms: 0,
            })),
        }
    }

    pub fn timeout(&self) -> u64 {
        self.inner.lock().timeout_ms
    }

    pub fn elapsed(&self) -> u64 {
        self.inner.lock().elapsed_ms
    }

    pub fn set_timeout(&self, timeout_ms: u64) {
        self.inner.lock().timeout_ms = timeout_ms;
    }

    fn charge(&self, ms: u64) {
        let mut state = self.inner.lock();
        state.elapsed_ms = state.elapsed_ms.saturating_add(ms);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunnableType {
    Test,
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
    Skip,
    Slow,
    Fixme,
    Fail,
    Teardown,
}

impl RunnableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnableType::Test => "test",
            RunnableType::BeforeAll => "beforeAll",
            RunnableType::AfterAll => "afterAll",
            RunnableType::BeforeEach => "beforeEach",
            RunnableType::AfterEach => "afterEach",
            RunnableType::Skip => "skip",
            RunnableType::Slow => "slow",
            RunnableType::Fixme => "fixme",
            RunnableType::Fail => "fail",
            RunnableType::Teardown => "teardown",
        }
    }
}

impl fmt::Display for RunnableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixturePhase {
    Setup,
    Teardown,
}

impl FixturePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixturePhase::Setup => "setup",
            FixturePhase::Teardown => "teardown",
        }
    }
}

#[derive(Clone, Debug)]
pub struct FixtureDescription {
    pub title: String,
    pub phase: FixturePhase,
    pub location: Option<Location>,
    /// Own budget for fixtures declared with a timeout.
    pub slot: Option<TimeSlot>,
}

#[derive(Clone, Debug)]
pub struct RunnableDescription {
    pub kind: RunnableType,
    pub location: Option<Location>,
    pub slot: Option<TimeSlot>,
    pub fixture: Option<FixtureDescription>,
}

impl RunnableDescription {
    pub fn new(kind: RunnableType) -> Self {
        Self {
            kind,
            location: None,
            slot: None,
            fixture: None,
        }
    }

    pub fn with_slot(mut self, slot: TimeSlot) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }

    /// The same runnable, now executing a fixture phase.
    pub fn with_fixture(&self, fixture: FixtureDescription) -> Self {
        let mut runnable = self.clone();
        runnable.fixture = Some(fixture);
        runnable
    }

    fn own_slot(&self) -> Option<&TimeSlot> {
        self.fixture
            .as_ref()
            .and_then(|f| f.slot.as_ref())
            .or(self.slot.as_ref())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TimeoutError {
    pub message: String,
    pub location: Option<Location>,
}

/// Why a runnable stopped before its body completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Interruption {
    TimedOut(TimeoutError),
    /// Explicit interrupt; never reported as a timeout.
    Interrupted,
}

#[derive(Debug)]
struct ManagerState {
    default_slot: TimeSlot,
    stack: Vec<RunnableDescription>,
    last_charge: Instant,
    ignore_timeouts: bool,
    interrupts: u64,
}

impl ManagerState {
    fn current_slot(&self) -> TimeSlot {
        self.stack
            .iter()
            .rev()
            .find_map(|r| r.own_slot().cloned())
            .unwrap_or_else(|| self.default_slot.clone())
    }

    fn charge(&mut self, now: Instant) {
        if !self.stack.is_empty() {
            let ms = now.saturating_duration_since(self.last_charge).as_millis() as u64;
            self.current_slot().charge(ms);
        }
        self.last_charge = now;
    }

    fn deadline(&self) -> Option<Instant> {
        if self.ignore_timeouts {
            return None;
        }
        let slot = self.current_slot();
        let timeout = slot.timeout();
        if timeout == 0 {
            return None;
        }
        let remaining = timeout.saturating_sub(slot.elapsed());
        Some(self.last_charge + Duration::from_millis(remaining))
    }
}

/// Handle to the countdown of one test (or of worker teardown).
#[derive(Clone, Debug)]
pub struct TimeoutManager {
    state: Arc<Mutex<ManagerState>>,
    changed: Arc<Notify>,
}

impl TimeoutManager {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManagerState {
                default_slot: TimeSlot::new(timeout_ms),
                stack: Vec::new(),
                last_charge: Instant::now(),
                ignore_timeouts: false,
                interrupts: 0,
            })),
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn default_slot(&self) -> TimeSlot {
        self.state.lock().default_slot.clone()
    }

    /// Timeout of the slot currently being charged.
    pub fn current_slot_timeout(&self) -> u64 {
        self.state.lock().current_slot().timeout()
    }

    /// Run `body` as `runnable`. Fails with [`Interruption`] when the
    /// active slot runs out or [`interrupt`](Self::interrupt) is called
    /// while it runs. The runnable is popped on every exit path.
    pub async fn with_runnable<F: Future>(
        &self,
        runnable: RunnableDescription,
        body: F,
    ) -> Result<F::Output, Interruption> {
        let (depth, mark) = {
            let mut state = self.state.lock();
            state.charge(Instant::now());
            state.stack.push(runnable);
            (state.stack.len(), state.interrupts)
        };
        let _guard = StackGuard {
            manager: self,
            depth,
        };
        self.changed.notify_waiters();

        tokio::pin!(body);
        tokio::select! {
            biased;
            output = &mut body => Ok(output),
            reason = self.expiry(depth, mark) => Err(reason),
        }
    }

    async fn expiry(&self, depth: usize, mark: u64) -> Interruption {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let state = self.state.lock();
                if state.interrupts != mark {
                    return Interruption::Interrupted;
                }
                if state.stack.len() == depth {
                    state.deadline()
                } else {
                    None
                }
            };

            match deadline {
                Some(deadline) if deadline <= Instant::now() => {
                    return Interruption::TimedOut(self.timeout_error());
                }
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Abort whatever is running now. Later runnables are unaffected.
    pub fn interrupt(&self) {
        self.state.lock().interrupts += 1;
        self.changed.notify_waiters();
    }

    /// Triple the budget of the active slot.
    pub fn slow(&self) {
        {
            let mut state = self.state.lock();
            state.charge(Instant::now());
            let slot = state.current_slot();
            slot.set_timeout(slot.timeout().saturating_mul(3));
        }
        self.changed.notify_waiters();
    }

    /// Replace the budget of the active slot.
    pub fn set_timeout(&self, timeout_ms: u64) {
        {
            let mut state = self.state.lock();
            state.charge(Instant::now());
            state.current_slot().set_timeout(timeout_ms);
        }
        self.changed.notify_waiters();
    }

    pub fn set_ignore_timeouts(&self, ignore: bool) {
        self.state.lock().ignore_timeouts = ignore;
        self.changed.notify_waiters();
    }

    /// Whether the slot `runnable` would be charged to has no time left.
    pub fn is_time_exhausted_for(&self, runnable: &RunnableDescription) -> bool {
        let state = self.state.lock();
        let slot = runnable
            .own_slot()
            .cloned()
            .unwrap_or_else(|| state.default_slot.clone());
        let timeout = slot.timeout();
        timeout > 0 && slot.elapsed() + 1 >= timeout
    }

    fn timeout_error(&self) -> TimeoutError {
        let state = self.state.lock();
        let timeout = state.current_slot().timeout();
        match state.stack.last() {
            Some(runnable) => timeout_error_for(runnable, timeout),
            None => TimeoutError {
                message: format!("Timeout of {timeout}ms exceeded."),
                location: None,
            },
        }
    }
}

struct StackGuard<'a> {
    manager: &'a TimeoutManager,
    depth: usize,
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.manager.state.lock();
            state.charge(Instant::now());
            state.stack.truncate(self.depth - 1);
        }
        self.manager.changed.notify_waiters();
    }
}

fn timeout_error_for(runnable: &RunnableDescription, timeout: u64) -> TimeoutError {
    let fixture = runnable.fixture.as_ref();
    let mut message = match runnable.kind {
        RunnableType::Test => match fixture {
            Some(f) if f.phase == FixturePhase::Setup => format!(
                "Test timeout of {timeout}ms exceeded while setting up \"{}\".",
                f.title
            ),
            Some(f) => format!(
                "Test finished within timeout of {timeout}ms, but tearing down \"{}\" ran out of time.\nPlease allow more time for the test, since teardown is attributed towards the test timeout budget.",
                f.title
            ),
            None => format!("Test timeout of {timeout}ms exceeded."),
        },
        RunnableType::BeforeEach | RunnableType::AfterEach => format!(
            "Test timeout of {timeout}ms exceeded while running \"{}\" hook.",
            runnable.kind
        ),
        RunnableType::BeforeAll | RunnableType::AfterAll => {
            format!("\"{}\" hook timeout of {timeout}ms exceeded.", runnable.kind)
        }
        RunnableType::Teardown => match fixture {
            Some(f) => format!(
                "Worker teardown timeout of {timeout}ms exceeded while {} \"{}\".",
                if f.phase == FixturePhase::Setup {
                    "setting up"
                } else {
                    "tearing down"
                },
                f.title
            ),
            None => format!("Worker teardown timeout of {timeout}ms exceeded."),
        },
        RunnableType::Skip | RunnableType::Slow | RunnableType::Fixme | RunnableType::Fail => {
            format!("\"{}\" modifier timeout of {timeout}ms exceeded.", runnable.kind)
        }
    };

    let fixture_with_slot = fixture.filter(|f| f.slot.is_some());
    if let Some(f) = fixture_with_slot {
        message = format!(
            "Fixture \"{}\" timeout of {timeout}ms exceeded during {}.",
            f.title,
            f.phase.as_str()
        );
    }
    let location = match fixture_with_slot {
        Some(f) => f.location.clone(),
        None => runnable.location.clone(),
    };
    TimeoutError { message, location }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fixture(title: &str, phase: FixturePhase, slot: Option<TimeSlot>) -> FixtureDescription {
        FixtureDescription {
            title: title.to_string(),
            phase,
            location: None,
            slot,
        }
    }

    #[tokio::test]
    async fn test_body_completes_within_budget() {
        let manager = TimeoutManager::new(1000);
        let result = manager
            .with_runnable(RunnableDescription::new(RunnableType::Test), async { 7 })
            .await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_timeout_message_for_test() {
        let manager = TimeoutManager::new(30);
        let result = manager
            .with_runnable(
                RunnableDescription::new(RunnableType::Test),
                tokio::time::sleep(Duration::from_secs(5)),
            )
            .await;
        match result {
            Err(Interruption::TimedOut(e)) => {
                assert_eq!(e.message, "Test timeout of 30ms exceeded.")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_interrupt_is_not_timeout() {
        let manager = TimeoutManager::new(0);
        let other = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            other.interrupt();
        });
        let result = manager
            .with_runnable(
                RunnableDescription::new(RunnableType::Test),
                tokio::time::sleep(Duration::from_secs(5)),
            )
            .await;
        assert_eq!(result, Err(Interruption::Interrupted));

        // Subsequent runnables are not affected by the earlier interrupt.
        let result = manager
            .with_runnable(RunnableDescription::new(RunnableType::AfterEach), async { 1 })
            .await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test]
    async fn test_fixture_slot_overrides_message() {
        let manager = TimeoutManager::new(10_000);
        let slot = TimeSlot::new(20);
        let runnable = RunnableDescription::new(RunnableType::Test)
            .with_fixture(fixture("db", FixturePhase::Setup, Some(slot)));
        let result = manager
            .with_runnable(runnable, tokio::time::sleep(Duration::from_secs(5)))
            .await;
        match result {
            Err(Interruption::TimedOut(e)) => {
                assert_eq!(e.message, "Fixture \"db\" timeout of 20ms exceeded during setup.")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(manager.default_slot().elapsed() < 20);
    }

    #[tokio::test]
    async fn test_nested_runnables_share_default_slot() {
        let manager = TimeoutManager::new(40);
        let inner = manager.clone();
        let result = manager
            .with_runnable(RunnableDescription::new(RunnableType::Test), async move {
                inner
                    .with_runnable(
                        RunnableDescription::new(RunnableType::Test).with_fixture(fixture(
                            "page",
                            FixturePhase::Teardown,
                            None,
                        )),
                        tokio::time::sleep(Duration::from_secs(5)),
                    )
                    .await
            })
            .await;
        match result {
            Ok(Err(Interruption::TimedOut(e))) => {
                assert!(e.message.starts_with("Test finished within timeout of 40ms"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(manager.default_slot().elapsed() >= 39);
    }

    #[tokio::test]
    async fn test_slow_triples_budget() {
        let manager = TimeoutManager::new(100);
        manager.slow();
        assert_eq!(manager.default_slot().timeout(), 300);
        manager.set_timeout(50);
        assert_eq!(manager.current_slot_timeout(), 50);
    }

    #[test]
    fn test_time_exhausted() {
        let manager = TimeoutManager::new(10);
        let runnable = RunnableDescription::new(RunnableType::AfterEach);
        assert!(!manager.is_time_exhausted_for(&runnable));
        manager.default_slot().charge(10);
        assert!(manager.is_time_exhausted_for(&runnable));
    }

    #[test]
    fn test_hook_messages() {
        let before_all = timeout_error_for(&RunnableDescription::new(RunnableType::BeforeAll), 5);
        assert_eq!(before_all.message, "\"beforeAll\" hook timeout of 5ms exceeded.");
        let each = timeout_error_for(&RunnableDescription::new(RunnableType::BeforeEach), 5);
        assert_eq!(
            each.message,
            "Test timeout of 5ms exceeded while running \"beforeEach\" hook."
        );
        let teardown = timeout_error_for(&RunnableDescription::new(RunnableType::Teardown), 5);
        assert_eq!(teardown.message, "Worker teardown timeout of 5ms exceeded.");
        let modifier = timeout_error_for(&RunnableDescription::new(RunnableType::Skip), 5);
        assert_eq!(modifier.message, "\"skip\" modifier timeout of 5ms exceeded.");
    }
}
