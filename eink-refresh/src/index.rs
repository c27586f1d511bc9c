use alloc::vec::Vec;

use embedded_graphics::primitives::Rectangle;

use crate::{
    image::{FlashMode, ImageSlot},
    Error,
};

/// Selects one of the two buffers of an [IndexBuffers] pair.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSel {
    A = 0,
    B = 1,
}

impl IndexSel {
    pub fn other(self) -> Self {
        match self {
            IndexSel::A => IndexSel::B,
            IndexSel::B => IndexSel::A,
        }
    }

    fn position(self) -> usize {
        self as usize
    }
}

/// The two index buffers.
///
/// `old` is the committed baseline the decoder reads from, and `new` is where the engine writes the
/// next computation. They only point at the same buffer between a commit and the start of the next
/// computation.
pub struct IndexBuffers {
    buffers: [Vec<u8>; 2],
    old: IndexSel,
    new: IndexSel,
}

impl IndexBuffers {
    pub fn new(len: usize) -> Result<Self, Error> {
        Ok(IndexBuffers {
            buffers: [zeroed(len)?, zeroed(len)?],
            old: IndexSel::A,
            new: IndexSel::A,
        })
    }

    pub fn old(&self) -> IndexSel {
        self.old
    }

    pub fn new_sel(&self) -> IndexSel {
        self.new
    }

    /// Points `new` at the unused buffer, ready for a computation.
    ///
    /// Fails if the flags already diverge, which means a previous computation was never committed.
    pub fn begin(&mut self) -> Result<(IndexSel, IndexSel), Error> {
        if self.old != self.new {
            return Err(Error::InvalidState);
        }
        self.new = self.old.other();
        Ok((self.old, self.new))
    }

    /// Makes the latest computation the decode baseline.
    pub fn commit(&mut self) {
        self.old = self.new;
    }

    /// Drops an uncommitted computation.
    pub fn abandon(&mut self) {
        self.new = self.old;
    }

    /// The buffer the decoder reads.
    pub fn committed(&self) -> &[u8] {
        &self.buffers[self.old.position()]
    }

    pub fn get(&self, sel: IndexSel) -> &[u8] {
        &self.buffers[sel.position()]
    }

    /// Splits the pair into the committed baseline and the computation target.
    pub(crate) fn split(&mut self) -> (&[u8], &mut [u8]) {
        let [a, b] = &mut self.buffers;
        match self.new {
            IndexSel::B => (a.as_slice(), b.as_mut_slice()),
            IndexSel::A => (b.as_slice(), a.as_mut_slice()),
        }
    }
}

fn zeroed(len: usize) -> Result<Vec<u8>, Error> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory)?;
    buffer.resize(len, 0);
    Ok(buffer)
}

/// Everything the engine needs to compute index data for one image pair.
pub struct IndexRequest<'a> {
    /// Committed index data of the previous image.
    pub old_index: &'a [u8],
    /// Destination for the new index data.
    pub new_index: &'a mut [u8],
    pub previous: &'a [u8],
    pub current: &'a [u8],
    pub flash: FlashMode,
    /// Ask the engine to detect the changed area, readable afterward with
    /// [crate::EinkHw::dirty_area].
    pub auto_area: bool,
    pub area: Rectangle,
}

impl<'a> IndexRequest<'a> {
    pub(crate) fn new(
        buffers: &'a mut IndexBuffers,
        previous: &'a ImageSlot,
        current: &'a ImageSlot,
    ) -> Self {
        let (old_index, new_index) = buffers.split();
        IndexRequest {
            old_index,
            new_index,
            previous: previous.pixels(),
            current: current.pixels(),
            flash: current.flash(),
            auto_area: current.auto_area(),
            area: current.area(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_flips_new_until_commit() {
        let mut buffers = IndexBuffers::new(4).unwrap();
        let (old, new) = buffers.begin().unwrap();
        assert_eq!(old, IndexSel::A);
        assert_eq!(new, IndexSel::B);
        assert_ne!(buffers.old(), buffers.new_sel());

        buffers.commit();
        assert_eq!(buffers.old(), IndexSel::B);
        assert_eq!(buffers.new_sel(), IndexSel::B);

        let (old, new) = buffers.begin().unwrap();
        assert_eq!((old, new), (IndexSel::B, IndexSel::A));
    }

    #[test]
    fn test_begin_with_diverged_flags_is_invalid() {
        let mut buffers = IndexBuffers::new(4).unwrap();
        buffers.begin().unwrap();
        assert_eq!(buffers.begin(), Err(Error::InvalidState));
        // The failed call leaves the selection alone.
        assert_eq!(buffers.old(), IndexSel::A);
        assert_eq!(buffers.new_sel(), IndexSel::B);
    }

    #[test]
    fn test_abandon_keeps_baseline() {
        let mut buffers = IndexBuffers::new(4).unwrap();
        buffers.begin().unwrap();
        buffers.abandon();
        assert_eq!(buffers.old(), IndexSel::A);
        assert_eq!(buffers.new_sel(), IndexSel::A);
        assert!(buffers.begin().is_ok());
    }

    #[test]
    fn test_split_targets_new_buffer() {
        let mut buffers = IndexBuffers::new(2).unwrap();
        buffers.begin().unwrap();
        {
            let (old, new) = buffers.split();
            assert_eq!(old, &[0, 0]);
            new.copy_from_slice(&[5, 6]);
        }
        assert_eq!(buffers.get(IndexSel::B), &[5, 6]);
        assert_eq!(buffers.committed(), &[0, 0]);
        buffers.commit();
        assert_eq!(buffers.committed(), &[5, 6]);
    }
}
