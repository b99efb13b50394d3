pub mod publisher;
pub mod registry;
pub mod room;

pub use publisher::{PublishReport, Publisher};
pub use registry::RoomRegistry;
pub use room::{PublishOutcome, RoomConfig, RoomHandle, RoomStats, Subscription};
