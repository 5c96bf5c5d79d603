//! # confer-core
//!
//! The room coordinator and its collaborators for the Confer meeting
//! signaling backend.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **RoomCoordinator** - single-writer state machine per room: roster,
//!   message fan-out, liveness sweep, meeting lifecycle
//! - **Storage** - durable string-keyed per-room key-value store
//! - **LifecycleApi** - narrow client for the external meeting service
//! - **RoomRegistry** - room code → coordinator map
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Channel   │────▶│ Coordinator │────▶│   Storage   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │  Lifecycle  │
//!                     └─────────────┘
//! ```

pub mod coordinator;
pub mod lifecycle;
pub mod registry;
pub mod storage;

pub use coordinator::{
    ChannelHandle, CoordinatorConfig, CoordinatorError, Outbound, RoomCoordinator, SweepOutcome,
};
pub use lifecycle::{HttpLifecycleClient, LifecycleApi, MeetingStatus, ReportStatus};
pub use registry::RoomRegistry;
pub use storage::{MemoryStorage, Storage, StorageError};
