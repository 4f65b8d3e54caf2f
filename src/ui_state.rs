//! Ephemeral UI state.
//!
//! Panel visibility, selections, drafts and other view-only state live here,
//! one observable slice per feature area. Nothing in this store is fetched,
//! goes stale, or reacts to cache invalidation.

use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::cache::lock::{read_lock, write_lock};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UiStateError {
    #[error("ui state area `{area}` does not hold a value of type {expected}")]
    TypeMismatch { area: String, expected: &'static str },
}

struct Slot {
    sender: Arc<dyn Any + Send + Sync>,
    reset: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
pub struct UiStateStore {
    slots: RwLock<BTreeMap<String, Slot>>,
}

impl UiStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the slice for `area`, created with `S::default()` on
    /// first use.
    pub fn slice<S>(&self, area: &str) -> Result<UiSlice<S>, UiStateError>
    where
        S: Clone + Default + Send + Sync + 'static,
    {
        if let Some(slot) = read_lock(&self.slots, "ui_state", "slice").get(area) {
            return downcast(area, slot);
        }

        let mut slots = write_lock(&self.slots, "ui_state", "slice");
        let slot = slots.entry(area.to_string()).or_insert_with(|| {
            debug!(area, state_type = type_name::<S>(), "UI state slice created");
            let (sender, _) = watch::channel(S::default());
            let resetter = sender.clone();
            Slot {
                sender: Arc::new(sender),
                reset: Box::new(move || {
                    resetter.send_replace(S::default());
                }),
            }
        });
        downcast(area, slot)
    }

    pub fn contains(&self, area: &str) -> bool {
        read_lock(&self.slots, "ui_state", "contains").contains_key(area)
    }

    pub fn areas(&self) -> Vec<String> {
        read_lock(&self.slots, "ui_state", "areas")
            .keys()
            .cloned()
            .collect()
    }

    /// Reset every slice to its default. Existing handles and receivers
    /// stay connected.
    pub fn clear(&self) {
        let slots = read_lock(&self.slots, "ui_state", "clear");
        for slot in slots.values() {
            (slot.reset)();
        }
        debug!(areas = slots.len(), "UI state cleared");
    }
}

impl fmt::Debug for UiStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UiStateStore")
            .field("areas", &self.areas())
            .finish()
    }
}

fn downcast<S>(area: &str, slot: &Slot) -> Result<UiSlice<S>, UiStateError>
where
    S: Clone + Default + Send + Sync + 'static,
{
    slot.sender
        .downcast_ref::<watch::Sender<S>>()
        .map(|sender| UiSlice {
            area: Arc::from(area),
            sender: sender.clone(),
        })
        .ok_or_else(|| UiStateError::TypeMismatch {
            area: area.to_string(),
            expected: type_name::<S>(),
        })
}

/// Typed handle to one feature area's state.
#[derive(Clone)]
pub struct UiSlice<S> {
    area: Arc<str>,
    sender: watch::Sender<S>,
}

impl<S: Clone + Default> UiSlice<S> {
    pub fn area(&self) -> &str {
        &self.area
    }

    pub fn get(&self) -> S {
        self.sender.borrow().clone()
    }

    pub fn set(&self, value: S) {
        self.sender.send_replace(value);
    }

    pub fn update<F: FnOnce(&mut S)>(&self, update: F) {
        self.sender.send_modify(update);
    }

    /// Receiver that observes every later change.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.sender.subscribe()
    }

    pub fn reset(&self) {
        self.set(S::default());
    }
}

impl<S> fmt::Debug for UiSlice<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UiSlice")
            .field("area", &self.area)
            .field("state_type", &type_name::<S>())
            .finish()
    }
}
