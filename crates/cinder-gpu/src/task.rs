//! Handles to work finishing on a background thread.

use std::thread;

use crossbeam::channel::{self, Receiver, TryRecvError};

use crate::error::{GpuError, Result};

/// Completion handle for work running off the calling thread.
///
/// The work always runs to completion; dropping the handle only discards the
/// result.
pub struct Pending<T> {
    rx: Option<Receiver<Result<T>>>,
    result: Option<Result<T>>,
}

impl<T: Send + 'static> Pending<T> {
    /// Run `work` on a new named thread.
    pub(crate) fn spawn<F>(name: &str, work: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = channel::bounded(1);
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = tx.send(work());
            });

        match spawned {
            Ok(_) => Self {
                rx: Some(rx),
                result: None,
            },
            Err(e) => Self::ready(Err(GpuError::Other(format!(
                "Failed to spawn {name} thread: {e}"
            )))),
        }
    }
}

impl<T> Pending<T> {
    /// A handle that is already complete.
    pub fn ready(result: Result<T>) -> Self {
        Self {
            rx: None,
            result: Some(result),
        }
    }

    /// Poll without blocking.
    pub fn is_complete(&mut self) -> bool {
        self.poll();
        self.result.is_some()
    }

    /// Take the result if the work has finished.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        self.poll();
        self.result.take()
    }

    /// Block until the work finishes.
    pub fn wait(mut self) -> Result<T> {
        if let Some(result) = self.result.take() {
            return result;
        }
        match self.rx.take() {
            Some(rx) => rx.recv().unwrap_or_else(|_| Err(abandoned())),
            None => Err(GpuError::InvalidState(
                "Pending result already taken".to_string(),
            )),
        }
    }

    fn poll(&mut self) {
        if self.result.is_some() {
            return;
        }
        let Some(rx) = &self.rx else {
            return;
        };
        match rx.try_recv() {
            Ok(result) => {
                self.result = Some(result);
                self.rx = None;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                self.result = Some(Err(abandoned()));
                self.rx = None;
            }
        }
    }
}

fn abandoned() -> GpuError {
    GpuError::InvalidState("background work ended without a result".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    #[test]
    fn ready_handle_is_complete() {
        let mut pending = Pending::ready(Ok(5));
        assert!(pending.is_complete());
        assert_eq!(pending.try_take(), Some(Ok(5)));
    }

    #[test]
    fn spawned_work_is_observed_after_it_finishes() {
        let (go_tx, go_rx) = channel::bounded::<()>(0);
        let mut pending = Pending::spawn("test", move || {
            go_rx.recv().ok();
            Ok(7)
        });
        assert!(!pending.is_complete());
        go_tx.send(()).unwrap();
        assert_eq!(pending.wait(), Ok(7));
    }

    #[test]
    fn panicking_work_reports_an_error() {
        let pending: Pending<u32> = Pending::spawn("test", || panic!("boom"));
        assert!(matches!(pending.wait(), Err(GpuError::InvalidState(_))));
    }
}
