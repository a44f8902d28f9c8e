//! Priority-gated admission shared by every chunk fetch of a scheduler.
//!
//! Streams and the preload warmer all dispatch through one
//! [`FetchAdmission`]. Waiting requests are admitted strictly by priority,
//! FIFO within a priority, up to a global cap on running requests.
//! `Preload` requests additionally wait until no more urgent request is
//! running, so warming upcoming CIDs only uses bandwidth the active stream
//! leaves idle.

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::chunk::Priority;
use super::queue::PriorityLanes;

#[derive(Debug, Default)]
struct AdmissionState {
    waiting: PriorityLanes<u64>,
    next_ticket: u64,
    running: usize,
    running_urgent: usize,
}

/// Global gate in front of the transport.
#[derive(Debug)]
pub struct FetchAdmission {
    capacity: usize,
    state: Mutex<AdmissionState>,
    changed: Notify,
}

impl FetchAdmission {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(AdmissionState::default()),
            changed: Notify::new(),
        }
    }

    /// Waits for a slot for one request at `priority`.
    ///
    /// Cancel safe: dropping the future gives up the place in line.
    pub async fn acquire(&self, priority: Priority) -> AdmissionPermit<'_> {
        let ticket = {
            let mut state = self.state.lock();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.waiting.push(priority, ticket);
            ticket
        };
        let mut waiter = Waiter {
            admission: self,
            ticket,
            admitted: false,
        };

        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.try_admit(priority, ticket) {
                waiter.admitted = true;
                return AdmissionPermit {
                    admission: self,
                    urgent: priority > Priority::Preload,
                };
            }
            changed.await;
        }
    }

    /// Requests currently holding a permit.
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Requests waiting for a permit.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }

    fn try_admit(&self, priority: Priority, ticket: u64) -> bool {
        let mut state = self.state.lock();
        let urgent = priority > Priority::Preload;

        if state.running >= self.capacity
            || state.waiting.peek() != Some(&ticket)
            || (!urgent && state.running_urgent > 0)
        {
            return false;
        }

        state.waiting.pop();
        state.running += 1;
        if urgent {
            state.running_urgent += 1;
        }
        drop(state);

        // The next request in line may fit as well
        self.changed.notify_waiters();
        true
    }
}

/// Slot held for the duration of one transport request.
#[derive(Debug)]
pub struct AdmissionPermit<'a> {
    admission: &'a FetchAdmission,
    urgent: bool,
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.admission.state.lock();
            state.running -= 1;
            if self.urgent {
                state.running_urgent -= 1;
            }
        }
        self.admission.changed.notify_waiters();
    }
}

struct Waiter<'a> {
    admission: &'a FetchAdmission,
    ticket: u64,
    admitted: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        let ticket = self.ticket;
        self.admission
            .state
            .lock()
            .waiting
            .take_first(|waiting| *waiting == ticket);
        self.admission.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cap_limits_running_requests() {
        let admission = FetchAdmission::new(2);

        let first = admission.acquire(Priority::Normal).await;
        let _second = admission.acquire(Priority::Normal).await;
        assert_eq!(admission.running(), 2);

        let third = admission.acquire(Priority::Critical);
        tokio::pin!(third);
        assert!(
            tokio::time::timeout(Duration::from_millis(10), third.as_mut())
                .await
                .is_err()
        );
        assert_eq!(admission.waiting(), 1);

        drop(first);
        let _third = third.await;
        assert_eq!(admission.running(), 2);
        assert_eq!(admission.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_admitted_by_priority() {
        let admission = Arc::new(FetchAdmission::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let blocker = admission.acquire(Priority::Critical).await;

        let mut tasks = Vec::new();
        for (name, priority) in [
            ("preload", Priority::Preload),
            ("normal", Priority::Normal),
            ("critical", Priority::Critical),
            ("high", Priority::High),
        ] {
            let admission = Arc::clone(&admission);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _permit = admission.acquire(priority).await;
                order.lock().push(name);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
            tokio::task::yield_now().await;
        }
        assert_eq!(admission.waiting(), 4);

        drop(blocker);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), ["critical", "high", "normal", "preload"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preload_waits_for_urgent_work() {
        let admission = FetchAdmission::new(4);
        let urgent = admission.acquire(Priority::High).await;

        let preload = admission.acquire(Priority::Preload);
        tokio::pin!(preload);
        assert!(
            tokio::time::timeout(Duration::from_millis(10), preload.as_mut())
                .await
                .is_err()
        );
        assert_eq!(admission.running(), 1);

        drop(urgent);
        let _preload = preload.await;
        assert_eq!(admission.running(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_leaves_line() {
        let admission = FetchAdmission::new(1);
        let holder = admission.acquire(Priority::Normal).await;

        {
            let waiting = admission.acquire(Priority::Critical);
            tokio::pin!(waiting);
            assert!(
                tokio::time::timeout(Duration::from_millis(10), waiting.as_mut())
                    .await
                    .is_err()
            );
            assert_eq!(admission.waiting(), 1);
        }
        assert_eq!(admission.waiting(), 0);

        drop(holder);
        let _next = admission.acquire(Priority::Normal).await;
        assert_eq!(admission.running(), 1);
    }
}
