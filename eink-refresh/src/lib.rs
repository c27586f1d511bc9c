//! This crate provides an `async`/`await` refresh pipeline for electrophoretic (e-ink) display
//! engines, the kind found in e-reader SoCs where the host computes waveform data and streams it to
//! the panel frame by frame.
//!
//! It is built on top of `embassy-sync` and `embassy-time`, and uses `embedded-graphics`
//! rectangles for update areas, so it runs on anything from a bare-metal executor to a hosted
//! one.
//!
//! ## Pipeline
//!
//! An [EinkManager] owns every buffer the pipeline needs:
//!
//! 1. Clients queue 8bpp images with [EinkUpdate::update_image].
//! 2. The scheduling loop ([EinkManager::run_detect_fresh]) has the engine compute per-pixel
//!    waveform indices for each (previous, current) image pair, waits for any overlapping update
//!    to leave the panel, and starts a pipeline through the [PipelineRegistry].
//! 3. Every decode-complete interrupt ([EinkManager::on_irq]) lets the decode worker
//!    ([EinkManager::run_decode_worker]) advance the pipeline by one wavedata frame.
//! 4. Every displayed frame ([EinkManager::on_frame_displayed]) asks the display worker
//!    ([EinkManager::run_display_worker]) to hand the next frame to the output DMA once the panel
//!    scan has passed the safe-swap line.
//!
//! [EinkManager::run] drives all three workers if you don't want to spawn them individually.
//!
//! ## Core traits
//!
//! - [EinkHw]: abstracts the display engine registers, output DMA, panel power and timing. You
//!   need to implement this trait for your SoC.
//! - [PipelineRegistry]: tracks the running update pipelines and their frame budgets.
//! - [EinkUpdate]: the client-facing surface, implemented by [EinkManager].
//!
//! Additionally, the crate provides:
//!
//! - `buffer` module: an 8bpp gray buffer implementing `embedded-graphics::DrawTarget`, whose data
//!   can be passed straight to [EinkUpdate::update_image].
//! - `config` module: panel configuration and the pipeline's tuning constants.
#![no_std]

extern crate alloc;

use core::error::Error as CoreError;

use bitflags::bitflags;
use embedded_graphics::primitives::Rectangle;
use embedded_hal::digital::{ErrorType as PinErrorType, OutputPin};
use thiserror::Error as ThisError;

pub mod buffer;
pub mod config;
pub mod image;
pub mod index;
pub mod pipeline;
pub mod wavedata;

mod log;
mod manager;
#[cfg(test)]
mod mock;

pub use config::EinkConfig;
pub use image::{Admission, UpdateMode};
pub use index::IndexRequest;
pub use manager::{EinkManager, Stats};
pub use pipeline::PipelineRegistry;

/// Errors reported by the refresh pipeline.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum Error {
    /// A queue is transiently full or empty.
    #[error("queue is busy")]
    Busy,
    /// The engine didn't finish in time.
    #[error("timed out waiting for the engine")]
    Timeout,
    /// The index buffer selection is inconsistent.
    #[error("index buffer selection is inconsistent")]
    InvalidState,
    /// No wavedata slot became free while decoding.
    #[error("no free wavedata buffer")]
    ResourceExhausted,
    /// Buffers couldn't be allocated.
    #[error("out of memory")]
    OutOfMemory,
    /// An image doesn't match the panel dimensions.
    #[error("invalid argument")]
    InvalidArgument,
    /// The manager was disabled while waiting.
    #[error("manager is disabled")]
    Disabled,
    /// A call into [EinkHw] failed.
    #[error("hardware error")]
    Hardware,
}

bitflags! {
    /// Pending interrupt sources of the display engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqStatus: u8 {
        /// A wavedata frame has been decoded.
        const DECODE_DONE = 0b0000_0001;
        /// Index data has been computed.
        const INDEX_DONE = 0b0000_0010;
    }
}

/// The client-facing operations of an e-ink manager.
#[allow(async_fn_in_trait)]
pub trait EinkUpdate {
    /// Powers up the engine and starts accepting updates. Does nothing if already enabled.
    fn enable(&self) -> Result<(), Error>;

    /// Stops the engine. Pending images stay queued until the next enable.
    fn disable(&self) -> Result<(), Error>;

    /// Queues an image for display, enabling the manager first if needed.
    ///
    /// `image` is an 8bpp gray image covering the whole panel (or the engine's input format if
    /// [EinkConfig::convert_input] is set). With `None`, the last image written to the queue slot
    /// is reused. For [UpdateMode::Rect], an all-zero `area` asks the engine to work out the
    /// changed area itself. Other modes always refresh the whole panel.
    async fn update_image(
        &self,
        image: Option<&[u8]>,
        mode: UpdateMode,
        area: Rectangle,
    ) -> Result<Admission, Error>;

    /// Overrides the panel temperature used to select waveforms.
    fn set_temperature(&self, temperature: u32);

    /// The temperature used for the next update.
    fn temperature(&self) -> u32;
}

/// Provides access to the display engine.
///
/// The manager calls these methods from inside its critical section, so none of them may block for
/// long. Completion of [EinkHw::start_index] and [EinkHw::start_decode] is reported through the
/// engine interrupt, which must call [EinkManager::on_irq].
///
/// Buffers passed to the engine belong to the manager. They're allocated once, never move, and
/// aren't written by the manager until the operation that uses them completes, so an
/// implementation may hand their addresses to DMA.
pub trait EinkHw {
    type Power: OutputPin;
    type Error: CoreError + From<<Self::Power as PinErrorType>::Error>;

    /// The panel power enable pin.
    fn power(&mut self) -> &mut Self::Power;

    fn clock_enable(&mut self) -> Result<(), Self::Error>;

    fn clock_disable(&mut self) -> Result<(), Self::Error>;

    /// Configures the engine and the output DMA for the panel.
    fn configure(&mut self, config: &EinkConfig) -> Result<(), Self::Error>;

    /// Stops the engine.
    fn engine_disable(&mut self) -> Result<(), Self::Error>;

    /// Loads the waveform tables. Called on the first enable only.
    fn load_waveform(&mut self) -> Result<(), Self::Error>;

    /// Writes the line and frame control words into a wavedata frame. Called once per frame buffer
    /// when the manager is created.
    fn init_wavedata(&mut self, frame: &mut [u8], config: &EinkConfig) -> Result<(), Self::Error>;

    fn irq_enable(&mut self);

    fn irq_disable(&mut self);

    /// Reads and acknowledges the pending interrupt sources.
    fn irq_query(&mut self) -> IrqStatus;

    /// Converts a client image into the 8bpp gray format.
    fn convert_image(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(), Self::Error>;

    /// Starts computing index data. Completion raises [IrqStatus::INDEX_DONE].
    fn start_index(&mut self, request: IndexRequest<'_>) -> Result<(), Self::Error>;

    /// The changed area found by the last index computation that had
    /// [IndexRequest::auto_area] set.
    fn dirty_area(&mut self) -> Rectangle;

    /// Starts decoding one wavedata frame from `index`. Completion raises
    /// [IrqStatus::DECODE_DONE].
    fn start_decode(
        &mut self,
        index: &[u8],
        wavedata: &mut [u8],
        config: &EinkConfig,
    ) -> Result<(), Self::Error>;

    /// Fully configures the output DMA with its first frame.
    fn output_configure(&mut self, wavedata: &[u8], config: &EinkConfig)
        -> Result<(), Self::Error>;

    /// Points the output DMA at the next frame.
    fn output_set_source(&mut self, wavedata: &[u8]) -> Result<(), Self::Error>;

    /// Tells the output DMA that its shadow buffer is ready to be swapped in.
    fn buffer_ready(&mut self) -> Result<(), Self::Error>;

    /// The line the panel is currently scanning.
    fn current_line(&mut self) -> u32;

    /// The first line at which the output buffer can be swapped without tearing.
    fn start_delay(&mut self) -> u32;

    /// Reads the panel temperature sensor, if there is one.
    fn temperature(&mut self) -> Option<u32> {
        None
    }

    /// Starts or stops the panel timing controller.
    fn panel_timing(&mut self, enable: bool) -> Result<(), Self::Error>;
}
