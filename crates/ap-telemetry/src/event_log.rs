//! Bus subscriber that re-emits every [`WorkflowEvent`] as a `tracing` event.
//!
//! Runs on its own thread so a slow log sink never holds up the dispatch
//! loop; the bus only ever pushes into an unbounded channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::{EventType, WorkflowEvent};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Handle to the logging thread. Dropping it detaches the thread.
pub struct EventLogger {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<usize>>,
}

impl EventLogger {
    /// Log whatever is still queued, stop the thread, and return how many
    /// events it logged in total.
    pub fn shutdown(mut self) -> usize {
        self.stop.store(true, Ordering::SeqCst);
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or(0)
    }
}

/// Subscribe to `bus` and start logging on a background thread.
pub fn spawn_event_logger(bus: &EventBus) -> EventLogger {
    let rx = bus.subscribe();
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);

    let handle = std::thread::Builder::new()
        .name("event-log".into())
        .spawn(move || {
            let mut logged = 0usize;
            loop {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(event) => {
                        log_event(&event);
                        logged += 1;
                    }
                    Err(flume::RecvTimeoutError::Timeout) => {
                        if flag.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    Err(flume::RecvTimeoutError::Disconnected) => return logged,
                }
            }
            for event in rx.try_iter() {
                log_event(&event);
                logged += 1;
            }
            logged
        });

    match handle {
        Ok(handle) => EventLogger {
            stop,
            handle: Some(handle),
        },
        Err(e) => {
            tracing::warn!(error = %e, "could not start event logger thread");
            EventLogger { stop, handle: None }
        }
    }
}

/// Emit one event at a level matching its type.
pub fn log_event(event: &WorkflowEvent) {
    let data = if event.data.is_null() {
        String::new()
    } else {
        event.data.to_string()
    };
    let todo_id = event.todo_id().unwrap_or("");

    if event.event_type.is_problem() {
        tracing::warn!(
            target: "workflow",
            event = %event.event_type,
            todo_id,
            data = %data,
            "{}",
            event.message
        );
    } else if event.event_type == EventType::Progress {
        tracing::debug!(
            target: "workflow",
            event = %event.event_type,
            data = %data,
            "{}",
            event.message
        );
    } else {
        tracing::info!(
            target: "workflow",
            event = %event.event_type,
            todo_id,
            "{}",
            event.message
        );
    }
}
