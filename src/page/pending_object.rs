//! Pending object request registry (component C8).
//!
//! A pending object request is the tuple `(ObjectId, tried candidates,
//! remaining candidates, waiters)`, resolved exactly once, dropped with a
//! "not found" outcome if no candidate remains. Concurrent local requests
//! for the same `ObjectId` collapse onto one registry entry.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::oneshot;

use crate::ids::{DeviceId, ObjectId};

/// Terminal result delivered to every waiter on a given `ObjectId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectOutcome {
    Present { bytes: Vec<u8>, is_synced_to_peer: bool },
    /// Every known candidate was tried and none had the object.
    NotFound,
    /// Torn down before resolving — page communicator dropped, or the last
    /// in-flight candidate disappeared with no replacement.
    Cancelled,
}

/// What an `ObjectResponse` reported, translated from the wire
/// [`crate::codec::ObjectResponseBody`] (sans the bytes/is_synced_to_peer
/// already folded into `Present`).
#[derive(Debug, Clone)]
pub enum ObjectResponseOutcome {
    Present { bytes: Vec<u8>, is_synced_to_peer: bool },
    NotFound,
    MissingReference,
}

/// What the caller (the page communicator) must do after feeding an event
/// into the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAction {
    /// The request resolved; waiters have already been notified.
    Resolved,
    /// Send an `ObjectRequest` for this object to this device next.
    Retry(DeviceId),
}

struct PendingEntry {
    candidates_tried: HashSet<DeviceId>,
    candidates_remaining: VecDeque<DeviceId>,
    in_flight: Option<DeviceId>,
    waiters: Vec<oneshot::Sender<ObjectOutcome>>,
}

impl PendingEntry {
    fn new() -> Self {
        Self {
            candidates_tried: HashSet::new(),
            candidates_remaining: VecDeque::new(),
            in_flight: None,
            waiters: Vec::new(),
        }
    }

    fn offer_candidate(&mut self, device: DeviceId) {
        if self.candidates_tried.contains(&device)
            || self.in_flight.as_ref() == Some(&device)
            || self.candidates_remaining.contains(&device)
        {
            return;
        }
        self.candidates_remaining.push_back(device);
    }

    fn dispatch_next(&mut self) -> Option<DeviceId> {
        let next = self.candidates_remaining.pop_front()?;
        self.in_flight = Some(next.clone());
        Some(next)
    }
}

#[derive(Default)]
pub struct PendingObjectRegistry {
    requests: HashMap<ObjectId, PendingEntry>,
}

impl PendingObjectRegistry {
    pub fn new() -> Self {
        Self { requests: HashMap::new() }
    }

    /// Register local interest in `id`. `known_candidates` seeds the
    /// candidate set (typically the page's current interest table). Returns
    /// a receiver for the eventual outcome, and — if this call should kick
    /// off a fresh `ObjectRequest` — the device to send it to.
    pub fn request(
        &mut self,
        id: ObjectId,
        known_candidates: impl IntoIterator<Item = DeviceId>,
    ) -> (oneshot::Receiver<ObjectOutcome>, Option<DeviceId>) {
        let entry = self.requests.entry(id).or_insert_with(PendingEntry::new);
        for candidate in known_candidates {
            entry.offer_candidate(candidate);
        }
        let (tx, rx) = oneshot::channel();
        entry.waiters.push(tx);
        let dispatch = if entry.in_flight.is_none() { entry.dispatch_next() } else { None };
        (rx, dispatch)
    }

    /// A device has declared interest in the owning page generally (a
    /// `WatchStartAck{true}`) — this triggers any pending object requests
    /// that were waiting for more candidates to retry against it. Offers
    /// `device` as a candidate to every pending request and dispatches to
    /// it wherever nothing else is already in flight.
    pub fn on_peer_available(&mut self, device: DeviceId) -> Vec<(ObjectId, DeviceId)> {
        let mut dispatched = Vec::new();
        for (id, entry) in self.requests.iter_mut() {
            entry.offer_candidate(device.clone());
            if entry.in_flight.is_none() {
                if let Some(next) = entry.dispatch_next() {
                    dispatched.push((id.clone(), next));
                }
            }
        }
        dispatched
    }

    /// Feed a response from `device` for `id`.
    pub fn on_response(
        &mut self,
        id: &ObjectId,
        device: &DeviceId,
        result: ObjectResponseOutcome,
    ) -> Option<ResponseAction> {
        let entry = self.requests.get_mut(id)?;
        if entry.in_flight.as_ref() != Some(device) {
            // Stale or duplicate response for a candidate we're not
            // currently waiting on; ignore.
            return None;
        }
        entry.in_flight = None;
        entry.candidates_tried.insert(device.clone());

        match result {
            ObjectResponseOutcome::Present { bytes, is_synced_to_peer } => {
                self.resolve(id, ObjectOutcome::Present { bytes, is_synced_to_peer });
                Some(ResponseAction::Resolved)
            }
            ObjectResponseOutcome::NotFound | ObjectResponseOutcome::MissingReference => {
                let entry = self.requests.get_mut(id)?;
                match entry.dispatch_next() {
                    Some(next) => Some(ResponseAction::Retry(next)),
                    None => {
                        self.resolve(id, ObjectOutcome::NotFound);
                        Some(ResponseAction::Resolved)
                    }
                }
            }
        }
    }

    /// `device` left the mesh. Drop it as a candidate everywhere; any
    /// request currently in flight against it either retries against
    /// another candidate or, if none remain, is cancelled. Returns the set
    /// of retries the caller must send.
    pub fn on_device_gone(&mut self, device: &DeviceId) -> Vec<(ObjectId, DeviceId)> {
        let mut retries = Vec::new();
        let mut cancelled = Vec::new();

        for (id, entry) in self.requests.iter_mut() {
            entry.candidates_tried.remove(device);
            entry.candidates_remaining.retain(|d| d != device);
            if entry.in_flight.as_ref() == Some(device) {
                entry.in_flight = None;
                match entry.dispatch_next() {
                    Some(next) => retries.push((id.clone(), next)),
                    None => cancelled.push(id.clone()),
                }
            }
        }

        for id in cancelled {
            self.resolve(&id, ObjectOutcome::Cancelled);
        }
        retries
    }

    /// Tear down every pending request (page communicator dropped).
    pub fn cancel_all(&mut self) {
        let ids: Vec<ObjectId> = self.requests.keys().cloned().collect();
        for id in ids {
            self.resolve(&id, ObjectOutcome::Cancelled);
        }
    }

    fn resolve(&mut self, id: &ObjectId, outcome: ObjectOutcome) {
        if let Some(entry) = self.requests.remove(id) {
            for waiter in entry.waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }
}
