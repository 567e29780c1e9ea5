pub mod diagnostics;
pub mod error;
pub mod health;
pub mod lorodoc;
pub mod messages;
pub mod presence;
pub mod ready;
pub mod scene_export;
pub mod scenegraph;

pub use diagnostics::*;
pub use error::*;
pub use health::*;
pub use messages::{BroadcastKind, CollabMessage, RoomBroadcast, SyncMessage};
pub use presence::*;
pub use ready::*;
pub use scene_export::*;
pub use scenegraph::*;
