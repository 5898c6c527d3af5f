//! Streaming flow control: per-client in-flight counters with first-error
//! caching and drain callbacks.

use std::collections::HashMap;
use std::fmt;

use capnrpc_wire::rpc::Exception;

/// Callback fired when a client's in-flight count drains to zero.
pub type DrainCallback = Box<dyn FnOnce() + Send>;

/// Per-client streaming state.
#[derive(Default)]
pub struct StreamState {
    in_flight: u32,
    stream_error: Option<Exception>,
    on_drain: Option<DrainCallback>,
}

impl fmt::Debug for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamState")
            .field("in_flight", &self.in_flight)
            .field("stream_error", &self.stream_error)
            .field("on_drain", &self.on_drain.is_some())
            .finish()
    }
}

/// Tracker for every streaming client of a peer.
#[derive(Debug, Default)]
pub struct StreamTracker {
    states: HashMap<u64, StreamState>,
}

impl StreamTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a streaming call about to be sent.
    ///
    /// After an error has been cached for the client, further sends fail
    /// immediately with that error.
    pub fn note_call_sent(&mut self, client: u64) -> Result<(), Exception> {
        let state = self.states.entry(client).or_default();
        if let Some(error) = &state.stream_error {
            return Err(error.clone());
        }
        state.in_flight += 1;
        Ok(())
    }

    /// Records the Return for a streaming call, caching the first error
    /// and firing the drain callback when the window empties.
    pub fn note_return(&mut self, client: u64, error: Option<&Exception>) {
        let state = self.states.entry(client).or_default();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.stream_error.is_none() {
            if let Some(error) = error {
                state.stream_error = Some(error.clone());
            }
        }
        if state.in_flight == 0 {
            if let Some(on_drain) = state.on_drain.take() {
                on_drain();
            }
        }
    }

    /// Registers a drain callback; fires immediately when the client is
    /// already drained.
    pub fn on_drain(&mut self, client: u64, callback: DrainCallback) {
        let state = self.states.entry(client).or_default();
        if state.in_flight == 0 {
            callback();
        } else {
            state.on_drain = Some(callback);
        }
    }

    /// The first error cached for a client, if any.
    pub fn first_error(&self, client: u64) -> Option<&Exception> {
        self.states.get(&client).and_then(|s| s.stream_error.as_ref())
    }

    /// Calls currently in flight for a client.
    pub fn in_flight(&self, client: u64) -> u32 {
        self.states.get(&client).map_or(0, |s| s.in_flight)
    }

    /// Forgets a client entirely.
    pub fn remove(&mut self, client: u64) {
        self.states.remove(&client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn drain_fires_when_window_empties() {
        let mut tracker = StreamTracker::new();
        tracker.note_call_sent(1).unwrap();
        tracker.note_call_sent(1).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        tracker.on_drain(1, Box::new(move || flag.store(true, Ordering::SeqCst)));

        tracker.note_return(1, None);
        assert!(!fired.load(Ordering::SeqCst));
        tracker.note_return(1, None);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn drain_fires_immediately_when_already_drained() {
        let mut tracker = StreamTracker::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        tracker.on_drain(9, Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn first_error_sticks_and_fails_later_sends() {
        let mut tracker = StreamTracker::new();
        tracker.note_call_sent(2).unwrap();
        tracker.note_call_sent(2).unwrap();
        tracker.note_return(2, Some(&Exception::failed("boom")));
        tracker.note_return(2, Some(&Exception::failed("later")));
        assert_eq!(tracker.first_error(2).unwrap().reason, "boom");

        let err = tracker.note_call_sent(2).unwrap_err();
        assert_eq!(err.reason, "boom");
        assert_eq!(tracker.in_flight(2), 0);
    }
}
