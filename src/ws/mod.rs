pub mod awareness;
pub mod collabctx;
pub mod connection;
pub mod handler;
pub mod registry;
pub mod room;
