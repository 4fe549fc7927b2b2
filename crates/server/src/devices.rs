//! Device and room lookup
//!
//! `CachedDirectory` is the core's read-through cache in front of the
//! external directory, keyed by device id and by network identity.
//! `MemoryDirectory` is the in-process backing used by tests and
//! single-box deployments.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use hearth_core::{DeviceDirectory, DeviceRecord, Result, Room};

/// In-memory directory
#[derive(Default)]
pub struct MemoryDirectory {
    rooms: RwLock<Vec<Room>>,
    devices: RwLock<Vec<DeviceRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_room(&self, room: Room) {
        self.rooms.write().push(room);
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDirectory {
    async fn room(&self, room_id: &str) -> Result<Option<Room>> {
        Ok(self.rooms.read().iter().find(|r| r.id == room_id).cloned())
    }

    async fn room_by_name(&self, name: &str) -> Result<Option<Room>> {
        Ok(self
            .rooms
            .read()
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        Ok(self.devices.read().iter().find(|d| d.id == device_id).cloned())
    }

    async fn device_by_network(&self, identity: &str) -> Result<Option<DeviceRecord>> {
        Ok(self
            .devices
            .read()
            .iter()
            .find(|d| d.network_identity.as_deref() == Some(identity))
            .cloned())
    }

    async fn upsert_device(&self, record: DeviceRecord) -> Result<()> {
        let mut devices = self.devices.write();
        match devices.iter_mut().find(|d| d.id == record.id) {
            Some(existing) => *existing = record,
            None => devices.push(record),
        }
        Ok(())
    }
}

/// Read-through cache over the external directory
pub struct CachedDirectory {
    inner: Arc<dyn DeviceDirectory>,
    rooms: DashMap<String, Room>,
    devices: DashMap<String, DeviceRecord>,
    /// network identity -> device id
    by_network: DashMap<String, String>,
}

impl CachedDirectory {
    pub fn new(inner: Arc<dyn DeviceDirectory>) -> Self {
        Self {
            inner,
            rooms: DashMap::new(),
            devices: DashMap::new(),
            by_network: DashMap::new(),
        }
    }

    pub async fn room(&self, room_id: &str) -> Result<Option<Room>> {
        if let Some(room) = self.rooms.get(room_id) {
            return Ok(Some(room.clone()));
        }
        let room = self.inner.room(room_id).await?;
        if let Some(room) = &room {
            self.rooms.insert(room.id.clone(), room.clone());
        }
        Ok(room)
    }

    pub async fn room_by_name(&self, name: &str) -> Result<Option<Room>> {
        // name lookups are registration-time only; go straight through
        let room = self.inner.room_by_name(name).await?;
        if let Some(room) = &room {
            self.rooms.insert(room.id.clone(), room.clone());
        }
        Ok(room)
    }

    pub async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        if let Some(device) = self.devices.get(device_id) {
            return Ok(Some(device.clone()));
        }
        let device = self.inner.device(device_id).await?;
        if let Some(device) = &device {
            self.cache_device(device);
        }
        Ok(device)
    }

    pub async fn device_by_network(&self, identity: &str) -> Result<Option<DeviceRecord>> {
        let cached = self.by_network.get(identity).map(|id| id.clone());
        if let Some(device_id) = cached {
            return self.device(&device_id).await;
        }
        let device = self.inner.device_by_network(identity).await?;
        if let Some(device) = &device {
            self.cache_device(device);
        }
        Ok(device)
    }

    /// Write-through upsert; the cache is updated on success.
    pub async fn upsert_device(&self, record: DeviceRecord) -> Result<()> {
        self.inner.upsert_device(record.clone()).await?;
        self.cache_device(&record);
        Ok(())
    }

    /// Drop cached rooms (config reload).
    pub fn invalidate_rooms(&self) {
        self.rooms.clear();
    }

    fn cache_device(&self, record: &DeviceRecord) {
        if let Some(identity) = &record.network_identity {
            self.by_network.insert(identity.clone(), record.id.clone());
        }
        self.devices.insert(record.id.clone(), record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::{Capabilities, DeviceKind};

    fn record(id: &str, network: Option<&str>) -> DeviceRecord {
        DeviceRecord {
            id: id.to_string(),
            kind: DeviceKind::Satellite,
            capabilities: Capabilities { speaker: true, ..Default::default() },
            network_identity: network.map(String::from),
            room_id: Some("kitchen".to_string()),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_on_room() {
        let directory = MemoryDirectory::new();
        directory.upsert_device(record("sat-1", None)).await.unwrap();
        directory.upsert_device(record("sat-1", None)).await.unwrap();

        let device = directory.device("sat-1").await.unwrap().unwrap();
        assert_eq!(device.room_id.as_deref(), Some("kitchen"));
    }

    #[tokio::test]
    async fn test_cached_network_lookup() {
        let inner = Arc::new(MemoryDirectory::new());
        inner.upsert_device(record("sat-1", Some("10.0.0.7"))).await.unwrap();
        let cached = CachedDirectory::new(inner);

        let device = cached.device_by_network("10.0.0.7").await.unwrap().unwrap();
        assert_eq!(device.id, "sat-1");
        // second hit comes from the cache
        let device = cached.device_by_network("10.0.0.7").await.unwrap().unwrap();
        assert_eq!(device.id, "sat-1");
        assert!(cached.device_by_network("10.0.0.9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_room_lookup_by_name() {
        let inner = Arc::new(MemoryDirectory::new());
        inner.add_room(Room { id: "kitchen".to_string(), name: "Kitchen".to_string(), sinks: vec![] });
        let cached = CachedDirectory::new(inner);

        let room = cached.room_by_name("kitchen").await.unwrap().unwrap();
        assert_eq!(room.id, "kitchen");
        let room = cached.room("kitchen").await.unwrap().unwrap();
        assert_eq!(room.name, "Kitchen");
    }
}
