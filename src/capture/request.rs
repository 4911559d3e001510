//! Request slot arena and queueing bookkeeping
//!
//! Requests are never created or destroyed while streaming. Slot `i` is bound
//! to buffer `i` for the whole session and only its state tag changes:
//!
//! ```text
//! Created -> Queued -> Completed -> Queued -> ...
//!               \           \
//!                +-----------+--> Retired   (teardown only)
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::capture::stream::StreamId;
use crate::error::{CaptureError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    /// Device has custody of the buffer
    Queued,
    /// Handed back by the device, not yet resubmitted
    Completed,
    /// Cancelled during teardown; never resubmitted
    Retired,
}

#[derive(Debug)]
struct PoolState {
    states: Box<[RequestState]>,
    in_flight: VecDeque<usize>,
    completed: usize,
}

/// Fixed-size pool of requests bound one-to-one to the stream's buffers.
///
/// The in-flight set keeps submission order. While streaming,
/// `queued() + completed() == size()` holds at every observation point.
#[derive(Debug)]
pub struct RequestPool {
    stream: StreamId,
    size: usize,
    state: Mutex<PoolState>,
}

impl RequestPool {
    pub fn new(stream: StreamId, size: usize) -> Self {
        Self {
            stream,
            size,
            state: Mutex::new(PoolState {
                states: vec![RequestState::Created; size].into_boxed_slice(),
                in_flight: VecDeque::with_capacity(size),
                completed: 0,
            }),
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(
        state: &mut PoolState,
        slot: usize,
        from: RequestState,
        to: RequestState,
    ) -> Result<()> {
        match state.states.get_mut(slot) {
            Some(current) if *current == from => {
                *current = to;
                Ok(())
            }
            Some(current) => Err(CaptureError::InvalidState(format!(
                "request {} is {:?}, expected {:?}",
                slot, current, from
            ))),
            None => Err(CaptureError::InvalidState(format!(
                "request {} out of range",
                slot
            ))),
        }
    }

    fn remove_in_flight(state: &mut PoolState, slot: usize) {
        if let Some(pos) = state.in_flight.iter().position(|&s| s == slot) {
            state.in_flight.remove(pos);
        }
    }

    /// Initial fill: `Created -> Queued`, appended to the in-flight set.
    pub fn submit(&self, slot: usize) -> Result<()> {
        let mut state = self.lock();
        Self::transition(&mut state, slot, RequestState::Created, RequestState::Queued)?;
        state.in_flight.push_back(slot);
        Ok(())
    }

    /// Device handed the request back: `Queued -> Completed`.
    ///
    /// Rejects a second completion for a slot that is not queued.
    pub fn complete(&self, slot: usize) -> Result<()> {
        let mut state = self.lock();
        Self::transition(
            &mut state,
            slot,
            RequestState::Queued,
            RequestState::Completed,
        )?;
        Self::remove_in_flight(&mut state, slot);
        state.completed += 1;
        Ok(())
    }

    /// Recycle step: same buffer, fresh submission. `Completed -> Queued`.
    pub fn reuse(&self, slot: usize) -> Result<()> {
        let mut state = self.lock();
        Self::transition(
            &mut state,
            slot,
            RequestState::Completed,
            RequestState::Queued,
        )?;
        state.completed -= 1;
        state.in_flight.push_back(slot);
        Ok(())
    }

    /// Take the request out of circulation. Returns the state it was in.
    pub fn retire(&self, slot: usize) -> Result<RequestState> {
        let mut state = self.lock();
        let previous = *state.states.get(slot).ok_or_else(|| {
            CaptureError::InvalidState(format!("request {} out of range", slot))
        })?;
        match previous {
            RequestState::Queued => Self::remove_in_flight(&mut state, slot),
            RequestState::Completed => state.completed -= 1,
            RequestState::Created | RequestState::Retired => {}
        }
        state.states[slot] = RequestState::Retired;
        Ok(previous)
    }

    pub fn state(&self, slot: usize) -> Option<RequestState> {
        self.lock().states.get(slot).copied()
    }

    /// Requests currently in device custody
    pub fn queued(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Requests completed but not yet resubmitted
    pub fn completed(&self) -> usize {
        self.lock().completed
    }

    /// Queued and completed counts read under one lock.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.in_flight.len(), state.completed)
    }

    /// Submission order of the requests the device currently holds.
    pub fn in_flight_order(&self) -> Vec<usize> {
        self.lock().in_flight.iter().copied().collect()
    }

    /// True once nothing is queued or awaiting resubmission.
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.in_flight.is_empty() && state.completed == 0
    }
}
