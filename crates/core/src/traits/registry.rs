//! Device and room directory interface
//!
//! Rooms and device records live in the external store; the core reads them
//! (and upserts device records at registration) through this trait. The
//! session router keeps a read-through cache in front of it.

use async_trait::async_trait;

use crate::device::{DeviceRecord, Room};
use crate::error::Result;

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn room(&self, room_id: &str) -> Result<Option<Room>>;

    /// Look up a room by its human name (registration declares names).
    async fn room_by_name(&self, name: &str) -> Result<Option<Room>>;

    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    /// Room auto-detection for stationary devices with no declared room.
    async fn device_by_network(&self, identity: &str) -> Result<Option<DeviceRecord>>;

    async fn upsert_device(&self, record: DeviceRecord) -> Result<()>;
}
