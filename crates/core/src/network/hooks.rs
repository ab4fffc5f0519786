//! Priority-ordered listener registry for request lifecycle notifications.
//!
//! Listeners are owned by the registry and lent out while one of their
//! callbacks runs. A listener that is lent out is invisible to nested
//! dispatches, which is what keeps re-entrant notifications (a pattern failing
//! the very request it is looking at) from calling back into itself.

use std::{collections::BTreeMap, fmt};

use serde::Serialize;

use super::{request::RequestFailedReason, RequestId, Simulation};

/// Identifier of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Well known listener priorities. Higher runs first.
pub mod priority {
    pub const VERY_HIGH: i32 = 2000;
    pub const HIGH: i32 = 1000;
    pub const NORMAL: i32 = 0;
    pub const LOW: i32 = -1000;
    pub const VERY_LOW: i32 = -2000;
}

/// Callbacks a resilience pattern receives about requests it listens to.
///
/// Every callback returns `true` when the notification has been fully handled,
/// in which case lower priority listeners do not see it.
pub trait RequestListener {
    fn name(&self) -> &str;

    /// Fixed for the lifetime of the listener.
    fn priority(&self) -> i32 {
        priority::NORMAL
    }

    fn on_request_send(&mut self, _sim: &mut Simulation, _request: RequestId) -> bool {
        false
    }

    fn on_request_arrival_at_target(&mut self, _sim: &mut Simulation, _request: RequestId) -> bool {
        false
    }

    fn on_request_result_arrived_at_requester(
        &mut self,
        _sim: &mut Simulation,
        _request: RequestId,
    ) -> bool {
        false
    }

    fn on_request_failed(
        &mut self,
        _sim: &mut Simulation,
        _request: RequestId,
        _reason: RequestFailedReason,
    ) -> bool {
        false
    }

    /// Releases all listener-local state. Called once, on deregistration.
    fn shutdown(&mut self, _sim: &mut Simulation) {}
}

/// The four lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notification {
    Send,
    ArrivalAtTarget,
    ResultArrivedAtRequester,
    Failed(RequestFailedReason),
}

impl Notification {
    pub(crate) fn deliver(
        self,
        listener: &mut dyn RequestListener,
        sim: &mut Simulation,
        request: RequestId,
    ) -> bool {
        match self {
            Self::Send => listener.on_request_send(sim, request),
            Self::ArrivalAtTarget => listener.on_request_arrival_at_target(sim, request),
            Self::ResultArrivedAtRequester => {
                listener.on_request_result_arrived_at_requester(sim, request)
            }
            Self::Failed(reason) => listener.on_request_failed(sim, request, reason),
        }
    }
}

struct ListenerSlot {
    priority: i32,
    name: String,
    /// `None` while the listener is lent out for dispatch.
    listener: Option<Box<dyn RequestListener>>,
}

/// Owns every registered listener.
#[derive(Default)]
pub struct HookRegistry {
    slots: BTreeMap<ListenerId, ListenerSlot>,
    next_id: u64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Box<dyn RequestListener>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.slots.insert(
            id,
            ListenerSlot {
                priority: listener.priority(),
                name: listener.name().to_owned(),
                listener: Some(listener),
            },
        );
        id
    }

    /// Removes a listener.
    ///
    /// Returns `Some(None)` when the listener is currently lent out; it is then
    /// handed back through [`restore`](Self::restore) as an error once its
    /// callback returns.
    pub fn deregister(
        &mut self,
        id: ListenerId,
    ) -> Option<Option<Box<dyn RequestListener>>> {
        self.slots.remove(&id).map(|slot| slot.listener)
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn priority(&self, id: ListenerId) -> Option<i32> {
        self.slots.get(&id).map(|s| s.priority)
    }

    pub fn name(&self, id: ListenerId) -> Option<&str> {
        self.slots.get(&id).map(|s| s.name.as_str())
    }

    /// Sorts `ids` into dispatch order: descending priority, then registration
    /// order. Unknown ids are dropped.
    pub fn dispatch_order(&self, ids: &[ListenerId]) -> Vec<ListenerId> {
        let mut ordered: Vec<(i32, ListenerId)> = ids
            .iter()
            .filter_map(|id| self.slots.get(id).map(|slot| (slot.priority, *id)))
            .collect();
        ordered.sort_by(|(pa, ia), (pb, ib)| pb.cmp(pa).then(ia.cmp(ib)));
        ordered.dedup_by_key(|(_, id)| *id);
        ordered.into_iter().map(|(_, id)| id).collect()
    }

    pub(crate) fn take(&mut self, id: ListenerId) -> Option<Box<dyn RequestListener>> {
        self.slots.get_mut(&id).and_then(|slot| slot.listener.take())
    }

    /// Puts a lent out listener back. Fails if it was deregistered meanwhile.
    pub(crate) fn restore(
        &mut self,
        id: ListenerId,
        listener: Box<dyn RequestListener>,
    ) -> Result<(), Box<dyn RequestListener>> {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.listener = Some(listener);
                Ok(())
            }
            None => Err(listener),
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<(ListenerId, Box<dyn RequestListener>)> {
        std::mem::take(&mut self.slots)
            .into_iter()
            .filter_map(|(id, slot)| slot.listener.map(|l| (id, l)))
            .collect()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.slots
                    .iter()
                    .map(|(id, slot)| (id, (&slot.name, slot.priority))),
            )
            .finish()
    }
}
