use std::{
    io,
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::span_handler::panic_message;

/// Runs a task on its own thread at a fixed rate until stopped.
pub struct Heartbeater {
    stop: Option<flume::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    // Disconnects when the thread exits.
    finished: flume::Receiver<()>,
}

impl Heartbeater {
    /// The first run happens `first_run` after starting, then once per `interval`.
    ///
    /// A panicking run is logged and the schedule carries on.
    pub fn start(
        name: &str,
        first_run: Duration,
        interval: Duration,
        mut task: impl FnMut() + Send + 'static,
    ) -> io::Result<Self> {
        let (stop, stopped) = flume::bounded::<()>(1);
        let (finished_sender, finished) = flume::bounded::<()>(1);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _finished = finished_sender;
                let mut next_run = Instant::now() + first_run;
                // Any message or a dropped sender means stop.
                while let Err(flume::RecvTimeoutError::Timeout) = stopped.recv_deadline(next_run)
                {
                    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| task())) {
                        log::warn!("heartbeat run panicked: {}", panic_message(&*panic));
                    }
                    next_run += interval;
                    let now = Instant::now();
                    if next_run < now {
                        // Skip the runs we were too slow for rather than bursting to catch up.
                        next_run = now + interval;
                    }
                }
                log::debug!("heartbeater stopping");
            })?;
        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
            finished,
        })
    }

    /// Waits until `deadline` for a run in progress to finish.
    ///
    /// Returns false when the run outlasted the deadline; the thread is then
    /// detached and exits once that run returns. Safe to call more than once.
    pub fn stop(&mut self, deadline: Instant) -> bool {
        drop(self.stop.take());
        let thread = match self.thread.take() {
            Some(thread) => thread,
            None => return true,
        };
        match self.finished.recv_deadline(deadline) {
            Err(flume::RecvTimeoutError::Timeout) => false,
            _ => {
                if thread.join().is_err() {
                    log::warn!("heartbeater thread panicked");
                }
                true
            }
        }
    }
}

impl Drop for Heartbeater {
    fn drop(&mut self) {
        // Never block a drop on a run in progress.
        self.stop(Instant::now());
    }
}
