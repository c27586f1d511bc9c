use embassy_time::Duration;
use embedded_graphics::{
    prelude::{Point, Size},
    primitives::Rectangle,
};

/// Panel temperature (°C) used when neither an override nor a sensor reading is available.
pub const DEFAULT_TEMPERATURE: u32 = 28;
/// Decode frame at which the first buffered frames are pushed and the panel is switched on.
///
/// Enabling the panel earlier shows garbage, since the output DMA would run dry before the decoder
/// is far enough ahead.
pub const PRIMING_FRAME: u32 = 2;
/// How long the engine may take to compute index data before the admission cycle is abandoned.
pub const INDEX_TIMEOUT: Duration = Duration::from_millis(200);
/// Attempts at finding a free wavedata slot before a decode step is skipped.
pub const WAVEDATA_RETRIES: u32 = 100;
/// Upper bound on each wait for a wavedata slot to be released.
pub const WAVEDATA_RETRY_INTERVAL: Duration = Duration::from_millis(1);
/// Interval between re-checks of overlapping pipelines while waiting for the display.
pub const OVERLAP_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Fallback wake-up of the scheduling loop when no notification arrives.
pub const SCHEDULER_POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Depth of the decode-complete event queue between the IRQ path and the decode worker.
pub const DECODE_EVENT_DEPTH: usize = 4;

pub const DEFAULT_IMAGE_SLOTS: usize = 8;
pub const DEFAULT_WAVEDATA_SLOTS: usize = 8;

pub const DEFAULT_WIDTH: u32 = 800;
pub const DEFAULT_HEIGHT: u32 = 600;

/// Computes the size of one decoded wavedata frame for a panel of the given dimensions.
///
/// Each line carries 4 pixels per 16-bit word plus 58 words of line blanking, and each frame has 20
/// additional lines of frame blanking.
pub const fn wavedata_buffer_length(width: u32, height: u32) -> usize {
    2 * (width as usize / 4 + 58) * (height as usize + 20)
}

/// Width of the source driver data bus.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBus {
    Bits8,
    Bits16,
}

/// Line and frame blanking of the panel, in pixel clocks and lines respectively.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelTiming {
    /// Line begin length.
    pub lbl: u32,
    /// Line end length.
    pub lel: u32,
    /// Line sync length.
    pub lsl: u32,
    /// Frame begin length.
    pub fbl: u32,
    /// Frame end length.
    pub fel: u32,
    /// Frame sync length.
    pub fsl: u32,
}

impl Default for PanelTiming {
    fn default() -> Self {
        PanelTiming {
            lbl: 4,
            lel: 44,
            lsl: 10,
            fbl: 4,
            fel: 12,
            fsl: 4,
        }
    }
}

/// Configuration for an [crate::EinkManager] and the engine it drives.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EinkConfig {
    pub width: u32,
    pub height: u32,
    /// Gray depth of the waveform, either 4 or 5 bits.
    pub bits: u8,
    pub data_bus: DataBus,
    pub timing: PanelTiming,
    /// Route client images through [crate::EinkHw::convert_image] instead of copying them.
    pub convert_input: bool,
    pub priming_frame: u32,
    pub index_timeout: Duration,
}

impl EinkConfig {
    pub fn new(width: u32, height: u32) -> Self {
        EinkConfig {
            width,
            height,
            bits: 4,
            data_bus: DataBus::Bits8,
            timing: PanelTiming::default(),
            convert_input: false,
            priming_frame: PRIMING_FRAME,
            index_timeout: INDEX_TIMEOUT,
        }
    }

    /// Size of one 8bpp image, and of one index buffer.
    pub fn image_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn wavedata_len(&self) -> usize {
        wavedata_buffer_length(self.width, self.height)
    }

    pub fn full_area(&self) -> Rectangle {
        Rectangle::new(Point::zero(), Size::new(self.width, self.height))
    }
}

impl Default for EinkConfig {
    fn default() -> Self {
        EinkConfig::new(DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }
}
