//! Transform polling stream
//!
//! Wraps the poll-and-branch loop every measurement application writes
//! around the tracking query: a lazy, infinite iterator of per-frame
//! transform batches. Iteration simply stops once the session leaves the
//! `Tracking` state; stopping the device itself is an explicit call.

use crate::error::ProtocolError;
use crate::session::{DeviceState, Tracker};
use crate::transform::TrackingFrame;

/// Blocking iterator over tracking frames.
///
/// Each `next()` issues one tracking query under the session command lock,
/// so other threads can still slip commands in between frames. The stream
/// is restartable: after [`Tracker::start_tracking`] a fresh stream picks
/// up where the device is.
pub struct TransformStream {
    tracker: Tracker,
}

impl TransformStream {
    pub(crate) fn new(tracker: Tracker) -> Self {
        Self { tracker }
    }

    /// Stop the device and consume the stream.
    ///
    /// Equivalent to dropping the stream and calling
    /// [`Tracker::stop_tracking`].
    pub fn stop(self) -> Result<(), ProtocolError> {
        self.tracker.stop_tracking()
    }
}

impl Iterator for TransformStream {
    type Item = Result<TrackingFrame, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.tracker.state() != DeviceState::Tracking {
            return None;
        }
        match self.tracker.track_frame() {
            // another thread stopped tracking or closed the handle between
            // the state check and the query; that ends the stream, it is
            // not an error
            Err(ProtocolError::InvalidStateTransition { .. }) | Err(ProtocolError::LinkClosed) => {
                None
            }
            other => Some(other),
        }
    }
}
