//! Core types shared by every layer of the transport: connection ids,
//! stream ids, the frame model, the packet builder and the error taxonomy.

use std::ops::{Index, IndexMut};

pub mod cid;
pub mod codec;
pub mod error;
pub mod frame;
pub mod packet;
pub mod sid;
pub mod varint;

/// Packet number spaces, which are also the encryption levels a packet is
/// protected with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Epoch {
    Initial = 0,
    Handshake = 1,
    Data = 2,
}

impl Epoch {
    pub const EPOCHS: [Epoch; 3] = [Epoch::Initial, Epoch::Handshake, Epoch::Data];

    pub fn iter() -> std::slice::Iter<'static, Epoch> {
        Self::EPOCHS.iter()
    }

    pub const fn count() -> usize {
        Self::EPOCHS.len()
    }
}

impl<T> Index<Epoch> for [T; 3] {
    type Output = T;

    fn index(&self, index: Epoch) -> &Self::Output {
        &self[index as usize]
    }
}

impl<T> IndexMut<Epoch> for [T; 3] {
    fn index_mut(&mut self, index: Epoch) -> &mut Self::Output {
        &mut self[index as usize]
    }
}
