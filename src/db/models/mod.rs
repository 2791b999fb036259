//! Database models split into domain-specific modules.

pub mod asset;
pub mod common;
pub mod contact;
pub mod document;
pub mod email;
pub mod order;
pub mod process;
pub mod project;
pub mod scheduled;
pub mod setting;
pub mod ticket;
pub mod user;

pub use asset::*;
pub use common::*;
pub use contact::*;
pub use document::*;
pub use email::*;
pub use order::*;
pub use process::*;
pub use project::*;
pub use scheduled::*;
pub use setting::*;
pub use ticket::*;
pub use user::*;
