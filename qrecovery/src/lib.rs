//! The reliable transport part: what was sent, what arrived, what got lost,
//! and who is waiting to hear about it.

pub mod byte_event;
pub mod crypto;
pub mod journal;
pub mod loss;
pub mod ranges;
pub mod recv;
pub mod rtt;
pub mod send;
