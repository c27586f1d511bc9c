use alloc::vec::Vec;

use heapless::Vec as SlotVec;

use crate::Error;

/// Ring of decoded waveform frames between the decoder (head) and the output DMA (tail).
///
/// The slot at the head is the one being decoded into, so the ring is full once the head is one
/// behind the tail and holds at most `N - 1` displayable frames.
pub struct WavedataRing<const N: usize> {
    slots: SlotVec<Vec<u8>, N>,
    head: usize,
    tail: usize,
}

impl<const N: usize> WavedataRing<N> {
    pub fn new(frame_len: usize) -> Result<Self, Error> {
        const { assert!(N >= 2, "The wavedata ring needs at least two slots") };
        let mut slots = SlotVec::new();
        for _ in 0..N {
            let mut frame = Vec::new();
            frame
                .try_reserve_exact(frame_len)
                .map_err(|_| Error::OutOfMemory)?;
            frame.resize(frame_len, 0);
            if slots.push(frame).is_err() {
                return Err(Error::OutOfMemory);
            }
        }
        Ok(WavedataRing {
            slots,
            head: 0,
            tail: 0,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        (self.head + 1) % N == self.tail
    }

    /// Number of decoded frames waiting for display.
    pub fn len(&self) -> usize {
        (self.head + N - self.tail) % N
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    /// The slot the next frame should be decoded into, if there is room.
    pub fn decode_target(&mut self) -> Option<&mut [u8]> {
        if self.is_full() {
            return None;
        }
        Some(self.slots[self.head].as_mut_slice())
    }

    /// Marks the slot at the head as decoded.
    pub fn commit(&mut self) -> Result<(), Error> {
        if self.is_full() {
            return Err(Error::Busy);
        }
        self.head = (self.head + 1) % N;
        Ok(())
    }

    /// The oldest decoded frame.
    pub fn display_source(&self) -> Option<&[u8]> {
        if self.is_empty() {
            return None;
        }
        Some(self.slots[self.tail].as_slice())
    }

    /// Hands the oldest decoded frame back to the decoder.
    pub fn release(&mut self) -> Result<(), Error> {
        if self.is_empty() {
            return Err(Error::Busy);
        }
        self.tail = (self.tail + 1) % N;
        Ok(())
    }

    /// Drops every undisplayed frame.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Mutable access to every frame, for prefilling control data.
    pub(crate) fn frames_mut(&mut self) -> impl Iterator<Item = &mut Vec<u8>> {
        self.slots.iter_mut()
    }
}
