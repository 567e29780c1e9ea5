pub mod health;
pub mod diagnostics;
pub mod scene_export;

pub use health::*;
pub use diagnostics::*;
pub use scene_export::*;
