//! Packet framing, queues and socket endpoints.

pub mod packet;
pub mod queue;
pub mod socket;
