//! In-order command queue backed by one worker thread

use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::backend::device::QueueTicket;
use crate::error::{ForgeError, ForgeResult};

pub(crate) type Command = Box<dyn FnOnce() -> ForgeResult<()> + Send + 'static>;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(QueueTicket, Command)>,
    /// Last ticket handed out
    submitted: u64,
    /// Last ticket finished (commands complete in submission order)
    completed: u64,
    /// Failed commands by ticket; kept so every wait on them reports it
    failures: BTreeMap<u64, String>,
    /// Last ticket whose failures `finish` has already reported
    finish_reported: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

pub(crate) struct HostQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl HostQueue {
    pub(crate) fn new(name: &str) -> ForgeResult<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("{}-queue", name))
            .spawn(move || worker_loop(worker_shared))
            .map_err(|e| ForgeError::DeviceResourceError(format!("cannot start queue worker: {}", e)))?;

        tracing::debug!("HostQueue::new: started worker for '{}'", name);
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub(crate) fn submit(&self, command: Command) -> ForgeResult<QueueTicket> {
        let mut state = self.shared.state.lock()?;
        if state.shutdown {
            return Err(ForgeError::DeviceResourceError(
                "queue is shutting down".to_string(),
            ));
        }
        state.submitted += 1;
        let ticket = QueueTicket(state.submitted);
        state.pending.push_back((ticket, command));
        drop(state);

        self.shared.cond.notify_all();
        tracing::trace!("HostQueue::submit: ticket {}", ticket);
        Ok(ticket)
    }

    /// Block until `ticket` completes; fails if that command failed
    pub(crate) fn wait(&self, ticket: QueueTicket, timeout: Option<Duration>) -> ForgeResult<()> {
        let state = self.wait_completed(ticket, timeout)?;
        match state.failures.get(&ticket.0) {
            Some(message) => Err(ForgeError::DeviceResourceError(format!(
                "command {} failed: {}",
                ticket, message
            ))),
            None => Ok(()),
        }
    }

    /// Block until every submitted command completes
    ///
    /// Reports the first failure among commands completed since the previous
    /// `finish`. Per-ticket failures stay visible to `wait`.
    pub(crate) fn finish(&self, timeout: Option<Duration>) -> ForgeResult<()> {
        let last = self.shared.state.lock()?.submitted;
        let mut state = self.wait_completed(QueueTicket(last), timeout)?;
        let since = state.finish_reported;
        state.finish_reported = state.finish_reported.max(last);
        if since >= last {
            return Ok(());
        }
        match state.failures.range(since + 1..=last).next() {
            Some((ticket, message)) => Err(ForgeError::DeviceResourceError(format!(
                "command {} failed: {}",
                QueueTicket(*ticket),
                message
            ))),
            None => Ok(()),
        }
    }

    /// Block until every submitted command completes, ignoring failures
    ///
    /// Used before host access to storage; command failures belong to the
    /// waits on their own tickets.
    pub(crate) fn drain(&self, timeout: Option<Duration>) -> ForgeResult<()> {
        let last = self.shared.state.lock()?.submitted;
        self.wait_completed(QueueTicket(last), timeout).map(|_| ())
    }

    fn wait_completed(
        &self,
        ticket: QueueTicket,
        timeout: Option<Duration>,
    ) -> ForgeResult<MutexGuard<'_, QueueState>> {
        let state = self.shared.state.lock()?;
        if ticket.0 > state.submitted {
            return Err(ForgeError::DeviceResourceError(format!(
                "ticket {} was never issued by this queue",
                ticket
            )));
        }

        match timeout {
            Some(timeout) => {
                let (state, result) = self
                    .shared
                    .cond
                    .wait_timeout_while(state, timeout, |s| s.completed < ticket.0)?;
                if result.timed_out() && state.completed < ticket.0 {
                    return Err(ForgeError::DeviceTimeout {
                        operation: format!("wait for command {}", ticket),
                        timeout,
                    });
                }
                Ok(state)
            }
            None => Ok(self
                .shared
                .cond
                .wait_while(state, |s| s.completed < ticket.0)?),
        }
    }

    pub(crate) fn is_complete(&self, ticket: QueueTicket) -> bool {
        self.shared
            .state
            .lock()
            .map(|s| s.completed >= ticket.0)
            .unwrap_or(false)
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.shutdown = true;
        }
        self.shared.cond.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("HostQueue::drop: queue worker panicked");
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let (ticket, command) = {
            let Ok(guard) = shared.state.lock() else { return };
            let Ok(mut state) = shared
                .cond
                .wait_while(guard, |s| s.pending.is_empty() && !s.shutdown)
            else {
                return;
            };
            // Pending work is drained before shutdown so that host memory
            // used by queued commands is never released under them.
            match state.pending.pop_front() {
                Some(next) => next,
                None => return,
            }
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(command)) {
            Ok(result) => result,
            Err(_) => Err(ForgeError::DeviceResourceError(format!(
                "command {} panicked",
                ticket
            ))),
        };

        let Ok(mut state) = shared.state.lock() else { return };
        if let Err(e) = outcome {
            tracing::error!("HostQueue: command {} failed: {}", ticket, e);
            state.failures.insert(ticket.0, e.to_string());
        }
        state.completed = ticket.0;
        drop(state);
        shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cmd(f: impl FnOnce() -> ForgeResult<()> + Send + 'static) -> Command {
        Box::new(f)
    }

    #[test]
    fn test_commands_run_in_order() {
        let queue = HostQueue::new("order").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let log = Arc::clone(&log);
            queue
                .submit(cmd(move || {
                    log.lock().unwrap().push(i);
                    Ok(())
                }))
                .unwrap();
        }
        queue.finish(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_wait_times_out() {
        let queue = HostQueue::new("slow").unwrap();
        let ticket = queue
            .submit(cmd(|| {
                thread::sleep(Duration::from_millis(300));
                Ok(())
            }))
            .unwrap();
        let err = queue.wait(ticket, Some(Duration::from_millis(10))).unwrap_err();
        assert!(matches!(err, ForgeError::DeviceTimeout { .. }));
        queue.wait(ticket, None).unwrap();
        assert!(queue.is_complete(ticket));
    }

    #[test]
    fn test_failure_reported_against_its_own_ticket() {
        let queue = HostQueue::new("fail").unwrap();
        let good = queue.submit(cmd(|| Ok(()))).unwrap();
        let bad = queue
            .submit(cmd(|| Err(ForgeError::DeviceResourceError("boom".to_string()))))
            .unwrap();
        let later = queue.submit(cmd(|| Ok(()))).unwrap();
        queue.drain(Some(Duration::from_secs(5))).unwrap();

        queue.wait(good, Some(Duration::from_secs(5))).unwrap();
        queue.wait(later, Some(Duration::from_secs(5))).unwrap();
        let err = queue.wait(bad, Some(Duration::from_secs(5))).unwrap_err();
        assert!(err.to_string().contains("boom"));
        // Still reported on a second wait
        assert!(queue.wait(bad, Some(Duration::from_secs(5))).is_err());
    }

    #[test]
    fn test_finish_reports_each_failure_once() {
        let queue = HostQueue::new("finish").unwrap();
        let bad = queue
            .submit(cmd(|| Err(ForgeError::DeviceResourceError("boom".to_string()))))
            .unwrap();
        let err = queue.finish(Some(Duration::from_secs(5))).unwrap_err();
        assert!(err.to_string().contains(&bad.to_string()));
        queue.finish(Some(Duration::from_secs(5))).unwrap();

        queue.submit(cmd(|| Ok(()))).unwrap();
        queue.finish(Some(Duration::from_secs(5))).unwrap();
        assert!(queue.wait(bad, None).is_err());
    }

    #[test]
    fn test_panicking_command_does_not_kill_worker() {
        let queue = HostQueue::new("panic").unwrap();
        queue.submit(cmd(|| panic!("kernel bug"))).unwrap();
        assert!(queue.finish(Some(Duration::from_secs(5))).is_err());

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        queue
            .submit(cmd(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        queue.finish(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_drains_pending_work() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let queue = HostQueue::new("drain").unwrap();
            for _ in 0..4 {
                let counter = Arc::clone(&ran);
                queue
                    .submit(cmd(move || {
                        thread::sleep(Duration::from_millis(5));
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }))
                    .unwrap();
            }
        }
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_unknown_ticket_rejected() {
        let queue = HostQueue::new("unknown").unwrap();
        assert!(queue.wait(QueueTicket(3), None).is_err());
        // Nothing submitted: ticket 0 is trivially complete
        queue.finish(None).unwrap();
    }
}
