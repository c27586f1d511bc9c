use alloc::vec::Vec;

use embedded_graphics::primitives::Rectangle;
use heapless::Vec as SlotVec;

use crate::{
    config::EinkConfig,
    log::{debug, trace},
    Error,
};

/// How the client wants an image to be shown.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Full initialisation refresh, which clears ghosting from the whole panel.
    Init,
    /// Partial refresh of a rectangle.
    Rect,
    /// Full-panel refresh.
    Global,
}

/// Flashing behaviour derived from the [UpdateMode] when an image is admitted.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashMode {
    Local,
    Global,
    Init,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Used,
}

/// Result of a successful [ImageQueue::admit].
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The image was added behind any pending ones.
    Queued,
    /// The queue was full. The image went into the spare slot at the write cursor, where the next
    /// admission will replace it before it is ever scheduled.
    Replaced,
}

/// One 8bpp image together with its update metadata.
pub struct ImageSlot {
    state: SlotState,
    pixels: Vec<u8>,
    mode: UpdateMode,
    flash: FlashMode,
    area: Rectangle,
    auto_area: bool,
}

impl ImageSlot {
    fn new(pixels: Vec<u8>) -> Self {
        ImageSlot {
            state: SlotState::Free,
            pixels,
            mode: UpdateMode::Init,
            flash: FlashMode::Global,
            area: Rectangle::zero(),
            auto_area: true,
        }
    }

    fn reset(&mut self) {
        self.state = SlotState::Free;
        self.flash = FlashMode::Global;
        self.mode = UpdateMode::Init;
        self.auto_area = true;
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    pub fn flash(&self) -> FlashMode {
        self.flash
    }

    /// The area that will be refreshed. This is all-zero until computed when [Self::auto_area] is
    /// set.
    pub fn area(&self) -> Rectangle {
        self.area
    }

    /// Whether the engine should work out the changed area itself.
    pub fn auto_area(&self) -> bool {
        self.auto_area
    }

    pub(crate) fn set_area(&mut self, area: Rectangle) {
        self.area = area;
    }
}

/// Fixed-capacity ring of rendered images waiting to be scheduled.
///
/// The slot at the read cursor holds the image currently on the panel (the "previous" image), and
/// the slot after it holds the next image to schedule (the "current" image). The queue is therefore
/// empty when the write cursor is one ahead of the read cursor, and holds at most `N - 2` pending
/// images.
pub struct ImageQueue<const N: usize> {
    slots: SlotVec<ImageSlot, N>,
    write: usize,
    read: usize,
    full_area: Rectangle,
}

impl<const N: usize> ImageQueue<N> {
    /// Allocates `N` white images of the configured dimensions.
    ///
    /// `N` must be at least three, since the previous and current images stay in the queue while a
    /// new one is written.
    ///
    /// ```compile_fail
    /// use eink_refresh::{config::EinkConfig, image::ImageQueue};
    ///
    /// let queue = ImageQueue::<2>::new(&EinkConfig::new(4, 4));
    /// ```
    pub fn new(config: &EinkConfig) -> Result<Self, Error> {
        const { assert!(N >= 3, "The image queue needs at least three slots") };
        let len = config.image_len();
        let mut slots = SlotVec::new();
        for _ in 0..N {
            let mut pixels = Vec::new();
            pixels
                .try_reserve_exact(len)
                .map_err(|_| Error::OutOfMemory)?;
            // An Init update starts from a white panel.
            pixels.resize(len, 0xff);
            if slots.push(ImageSlot::new(pixels)).is_err() {
                return Err(Error::OutOfMemory);
            }
        }
        Ok(ImageQueue {
            slots,
            write: 1,
            read: 0,
            full_area: config.full_area(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.write == (self.read + 1) % N
    }

    pub fn is_full(&self) -> bool {
        (self.write + 1) % N == self.read
    }

    /// Number of pending images.
    pub fn len(&self) -> usize {
        (self.write + N - self.read - 1) % N
    }

    pub fn write_cursor(&self) -> usize {
        self.write
    }

    pub fn read_cursor(&self) -> usize {
        self.read
    }

    /// Stores an image and its update parameters at the write cursor.
    ///
    /// `source` is copied verbatim, or passed to `convert` when given. With no source the slot keeps
    /// its current pixels. If the queue is full the spare slot at the write cursor is overwritten and
    /// the cursor stays put.
    pub fn admit<C>(
        &mut self,
        source: Option<&[u8]>,
        mode: UpdateMode,
        area: Rectangle,
        convert: Option<C>,
    ) -> Result<Admission, Error>
    where
        C: FnOnce(&[u8], &mut [u8]) -> Result<(), Error>,
    {
        let full = self.is_full();
        let full_area = self.full_area;
        let slot = &mut self.slots[self.write];

        if let Some(source) = source {
            match convert {
                Some(convert) => convert(source, &mut slot.pixels)?,
                None => {
                    if source.len() != slot.pixels.len() {
                        debug!(
                            "Rejecting image of {} bytes, expected {}",
                            source.len(),
                            slot.pixels.len()
                        );
                        return Err(Error::InvalidArgument);
                    }
                    slot.pixels.copy_from_slice(source);
                }
            }
        }

        slot.state = SlotState::Used;
        slot.mode = mode;
        slot.auto_area = false;
        match mode {
            UpdateMode::Rect => {
                slot.flash = FlashMode::Local;
                if area == Rectangle::zero() {
                    slot.auto_area = true;
                    slot.area = Rectangle::zero();
                } else {
                    slot.area = area;
                }
            }
            UpdateMode::Init => {
                slot.flash = FlashMode::Init;
                slot.area = full_area;
            }
            UpdateMode::Global => {
                slot.flash = FlashMode::Global;
                slot.area = full_area;
            }
        }
        trace!(
            "Admitted image at slot {}, mode {:?}, auto area {}",
            self.write,
            mode,
            slot.auto_area
        );

        if full {
            debug!("Image queue full, overwriting slot {}", self.write);
            Ok(Admission::Replaced)
        } else {
            self.write = (self.write + 1) % N;
            Ok(Admission::Queued)
        }
    }

    /// Releases the previous image, making the current image the new baseline.
    pub fn consume(&mut self) -> Result<(), Error> {
        if self.is_empty() {
            trace!("Image queue is empty");
            return Err(Error::Busy);
        }
        self.slots[self.read].reset();
        self.read = (self.read + 1) % N;
        Ok(())
    }

    /// The next image to schedule.
    pub fn current(&self) -> &ImageSlot {
        &self.slots[(self.read + 1) % N]
    }

    pub(crate) fn current_mut(&mut self) -> &mut ImageSlot {
        &mut self.slots[(self.read + 1) % N]
    }

    /// The image that [Self::current] is drawn over.
    pub fn previous(&self) -> &ImageSlot {
        &self.slots[self.read]
    }
}
