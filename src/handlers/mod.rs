//! Business logic per event kind.

pub mod ack;
pub mod group;
pub mod login;
pub mod ping;
pub mod private_message;
