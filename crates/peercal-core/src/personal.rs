//! Personal, non-replicated store
//!
//! Holds the user's private calendar and the bookkeeping needed to reopen
//! shared rooms after a restart. Nothing in here ever leaves the node.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{RoomError, RoomResult};
use crate::storage::Storage;
use crate::types::{RoomDetails, RoomId, ScheduleMap, SCHEDULE_KEY};

/// Key for the saved-rooms map
pub const ROOMS_DETAILS_KEY: &str = "roomsDetails";

/// Private key-value store for this node's user
#[derive(Clone)]
pub struct PersonalStore {
    storage: Storage,
}

impl PersonalStore {
    /// Wrap the node's storage; seeds an empty personal schedule on first
    /// use so readers never see a missing key
    pub fn new(storage: Storage) -> RoomResult<Self> {
        let store = Self { storage };
        if store.get(SCHEDULE_KEY)?.is_none() {
            store.put(SCHEDULE_KEY, serde_json::json!({}))?;
            debug!("Seeded empty personal schedule");
        }
        Ok(store)
    }

    /// Read a value
    pub fn get(&self, key: &str) -> RoomResult<Option<serde_json::Value>> {
        self.storage.load_personal(key)
    }

    /// Write a value
    pub fn put(&self, key: &str, value: serde_json::Value) -> RoomResult<()> {
        self.storage.save_personal(key, &value)
    }

    /// The personal calendar
    pub fn schedule(&self) -> RoomResult<ScheduleMap> {
        match self.get(SCHEDULE_KEY)? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| RoomError::Serialization(format!("Corrupt personal schedule: {}", e))),
            None => Ok(ScheduleMap::new()),
        }
    }

    /// Merge date entries into the personal calendar
    ///
    /// Only the given dates change; a date mapped to JSON null is removed.
    pub fn adjust_schedule(&self, changes: &ScheduleMap) -> RoomResult<ScheduleMap> {
        let mut schedule = self.schedule()?;
        for (date, entry) in changes {
            if entry.is_null() {
                schedule.remove(date);
            } else {
                schedule.insert(date.clone(), entry.clone());
            }
        }
        self.put(SCHEDULE_KEY, serde_json::to_value(&schedule).map_err(|e| {
            RoomError::Serialization(format!("Failed to encode schedule: {}", e))
        })?)?;
        Ok(schedule)
    }

    /// The saved-rooms map: room id to name and topic
    pub fn rooms_details(&self) -> RoomResult<BTreeMap<RoomId, RoomDetails>> {
        match self.get(ROOMS_DETAILS_KEY)? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| RoomError::Serialization(format!("Corrupt rooms details: {}", e))),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Record a room so it can be reopened after a restart
    pub fn add_room_details(&self, room_id: &RoomId, details: RoomDetails) -> RoomResult<()> {
        let mut rooms = self.rooms_details()?;
        rooms.insert(room_id.clone(), details);
        self.put(
            ROOMS_DETAILS_KEY,
            serde_json::to_value(&rooms).map_err(|e| {
                RoomError::Serialization(format!("Failed to encode rooms details: {}", e))
            })?,
        )?;
        debug!(%room_id, "Saved room details");
        Ok(())
    }
}
