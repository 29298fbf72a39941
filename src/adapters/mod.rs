//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports (Port/Adapter pattern).
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Ports (Traits)                                │
//! │             RemoteStore        │      EventPublisher             │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Adapters (This Module)                          │
//! │  InMemoryRemote │ DirectoryRemote                                │
//! │  LoggingEventPublisher │ InMemoryEventCollector                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod directory;
mod event_publisher;
mod memory;

pub use directory::DirectoryRemote;
pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use memory::InMemoryRemote;
