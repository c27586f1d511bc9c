//! In-memory engine and pipeline registry for tests.

use alloc::vec::Vec;
use core::convert::Infallible;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Timer;
use embedded_graphics::primitives::Rectangle;
use embedded_hal::digital::{ErrorType, OutputPin};
use thiserror::Error as ThisError;

use crate::{
    config::EinkConfig, image::FlashMode, pipeline::PipelineRegistry, EinkHw, EinkManager,
    IndexRequest, IrqStatus, UpdateMode,
};

/// Frames per pipeline unless a test asks for another budget.
pub(crate) const PIPELINE_FRAMES: u32 = 6;

pub(crate) type TestManager<const I: usize, const F: usize> =
    EinkManager<CriticalSectionRawMutex, MockHw, MockRegistry, I, F>;

/// A 16x8 panel, so images are 128 bytes.
pub(crate) fn test_config() -> EinkConfig {
    EinkConfig::new(16, 8)
}

pub(crate) fn test_manager<const I: usize, const F: usize>(frames: u32) -> TestManager<I, F> {
    manager_with_config(test_config(), frames)
}

pub(crate) fn manager_with_config<const I: usize, const F: usize>(
    config: EinkConfig,
    frames: u32,
) -> TestManager<I, F> {
    EinkManager::new(config, MockHw::default(), MockRegistry::new(4, frames)).unwrap()
}

/// Puts a computed index in place and starts a full-panel pipeline from it.
pub(crate) fn start_pipeline<const I: usize, const F: usize>(manager: &TestManager<I, F>) {
    manager.with_shared(|s| {
        s.index.begin().unwrap();
        s.index_fresh = true;
    });
    embassy_futures::block_on(manager.start_or_extend(
        Rectangle::zero(),
        UpdateMode::Global,
        28,
    ))
    .unwrap();
}

/// Stands in for the engine's completion interrupts and the panel's frame clock.
///
/// Raises pending interrupts on every tick, and reports a displayed frame every fourth tick while
/// the panel is scanning.
pub(crate) async fn run_engine<const I: usize, const F: usize>(manager: &TestManager<I, F>) {
    let mut tick: u32 = 0;
    loop {
        Timer::after_micros(100).await;
        tick = tick.wrapping_add(1);
        let (irq, scanning) = manager.with_hw(|hw| (!hw.pending.is_empty(), hw.scanning()));
        if irq {
            manager.on_irq();
        }
        if scanning && tick % 4 == 0 {
            manager.with_registry(|r| r.on_vsync());
            manager.on_frame_displayed();
        }
    }
}

#[derive(Debug, ThisError)]
#[error("mock engine failure")]
pub(crate) struct MockError;

impl From<Infallible> for MockError {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockPin {
    pub(crate) high: bool,
}

impl ErrorType for MockPin {
    type Error = Infallible;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.high = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.high = true;
        Ok(())
    }
}

pub(crate) struct MockHw {
    pub(crate) power: MockPin,
    pub(crate) clock_on: bool,
    pub(crate) irq_enabled: bool,
    pub(crate) timing_on: bool,
    pub(crate) configured: u32,
    pub(crate) waveform_loads: u32,
    pub(crate) wavedata_inits: u32,
    pub(crate) fail_configure: bool,
    pub(crate) pending: IrqStatus,
    /// Raise [IrqStatus::INDEX_DONE] once an index computation is started.
    pub(crate) complete_index: bool,
    pub(crate) index_requests: u32,
    pub(crate) last_flash: Option<FlashMode>,
    pub(crate) dirty: Rectangle,
    pub(crate) decodes: u32,
    pub(crate) conversions: u32,
    pub(crate) output_configs: u32,
    pub(crate) outputs: u32,
    pub(crate) buffer_ready: u32,
    /// First byte of every frame handed to the output.
    pub(crate) sources: Vec<u8>,
    pub(crate) line: u32,
    pub(crate) lines_per_frame: u32,
    pub(crate) start_delay: u32,
    pub(crate) temperature: Option<u32>,
}

impl Default for MockHw {
    fn default() -> Self {
        MockHw {
            power: MockPin::default(),
            clock_on: false,
            irq_enabled: false,
            timing_on: false,
            configured: 0,
            waveform_loads: 0,
            wavedata_inits: 0,
            fail_configure: false,
            pending: IrqStatus::empty(),
            complete_index: true,
            index_requests: 0,
            last_flash: None,
            dirty: Rectangle::zero(),
            decodes: 0,
            conversions: 0,
            output_configs: 0,
            outputs: 0,
            buffer_ready: 0,
            sources: Vec::new(),
            line: 0,
            lines_per_frame: 20,
            start_delay: 4,
            temperature: None,
        }
    }
}

impl MockHw {
    pub(crate) fn scanning(&self) -> bool {
        self.power.high && self.timing_on && self.output_configs > 0
    }
}

impl EinkHw for MockHw {
    type Power = MockPin;
    type Error = MockError;

    fn power(&mut self) -> &mut Self::Power {
        &mut self.power
    }

    fn clock_enable(&mut self) -> Result<(), Self::Error> {
        self.clock_on = true;
        Ok(())
    }

    fn clock_disable(&mut self) -> Result<(), Self::Error> {
        self.clock_on = false;
        Ok(())
    }

    fn configure(&mut self, _config: &EinkConfig) -> Result<(), Self::Error> {
        if self.fail_configure {
            return Err(MockError);
        }
        self.configured += 1;
        Ok(())
    }

    fn engine_disable(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn load_waveform(&mut self) -> Result<(), Self::Error> {
        self.waveform_loads += 1;
        Ok(())
    }

    fn init_wavedata(&mut self, frame: &mut [u8], _config: &EinkConfig) -> Result<(), Self::Error> {
        if let Some(last) = frame.last_mut() {
            *last = 0xa5;
        }
        self.wavedata_inits += 1;
        Ok(())
    }

    fn irq_enable(&mut self) {
        self.irq_enabled = true;
    }

    fn irq_disable(&mut self) {
        self.irq_enabled = false;
    }

    fn irq_query(&mut self) -> IrqStatus {
        core::mem::replace(&mut self.pending, IrqStatus::empty())
    }

    fn convert_image(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(), Self::Error> {
        // Keeps the first channel of each 32-bit pixel.
        for (pixel, gray) in src.chunks_exact(4).zip(dst.iter_mut()) {
            *gray = pixel[0];
        }
        self.conversions += 1;
        Ok(())
    }

    fn start_index(&mut self, request: IndexRequest<'_>) -> Result<(), Self::Error> {
        // High nibble from the previous image, low nibble from the current one.
        for ((index, previous), current) in request
            .new_index
            .iter_mut()
            .zip(request.previous)
            .zip(request.current)
        {
            *index = (previous & 0xf0) | (current >> 4);
        }
        self.index_requests += 1;
        self.last_flash = Some(request.flash);
        if self.complete_index {
            self.pending |= IrqStatus::INDEX_DONE;
        }
        Ok(())
    }

    fn dirty_area(&mut self) -> Rectangle {
        self.dirty
    }

    fn start_decode(
        &mut self,
        index: &[u8],
        wavedata: &mut [u8],
        _config: &EinkConfig,
    ) -> Result<(), Self::Error> {
        if let (Some(first), Some(index)) = (wavedata.first_mut(), index.first()) {
            *first = *index;
        }
        self.decodes += 1;
        self.pending |= IrqStatus::DECODE_DONE;
        Ok(())
    }

    fn output_configure(
        &mut self,
        wavedata: &[u8],
        _config: &EinkConfig,
    ) -> Result<(), Self::Error> {
        self.sources.extend(wavedata.first().copied());
        self.output_configs += 1;
        Ok(())
    }

    fn output_set_source(&mut self, wavedata: &[u8]) -> Result<(), Self::Error> {
        self.sources.extend(wavedata.first().copied());
        self.outputs += 1;
        Ok(())
    }

    fn buffer_ready(&mut self) -> Result<(), Self::Error> {
        self.buffer_ready += 1;
        Ok(())
    }

    fn current_line(&mut self) -> u32 {
        self.line = (self.line + 1) % self.lines_per_frame;
        self.line
    }

    fn start_delay(&mut self) -> u32 {
        self.start_delay
    }

    fn temperature(&mut self) -> Option<u32> {
        self.temperature
    }

    fn panel_timing(&mut self, enable: bool) -> Result<(), Self::Error> {
        self.timing_on = enable;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MockPipeline {
    pub(crate) area: Rectangle,
    pub(crate) mode: UpdateMode,
    pub(crate) frames: u32,
    decoded: u32,
    displayed: u32,
}

impl MockPipeline {
    fn new(area: Rectangle, mode: UpdateMode, frames: u32) -> Self {
        MockPipeline {
            area,
            mode,
            frames,
            decoded: 0,
            displayed: 0,
        }
    }

    fn retired(&self) -> bool {
        self.decoded >= self.frames && self.displayed >= self.frames
    }

    fn overlaps(&self, area: &Rectangle) -> bool {
        // All-zero areas cover the whole panel.
        self.area.is_zero_sized()
            || area.is_zero_sized()
            || !self.area.intersection(area).is_zero_sized()
    }
}

/// A pipeline start, with the number of frames the panel had shown so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MockStart {
    pub(crate) area: Rectangle,
    pub(crate) mode: UpdateMode,
    pub(crate) vsyncs: u32,
}

/// Keeps each pipeline running until it has been both decoded and displayed for its whole budget.
pub(crate) struct MockRegistry {
    pub(crate) capacity: usize,
    pub(crate) frames: u32,
    pub(crate) running: Vec<MockPipeline>,
    pub(crate) queued: Option<MockPipeline>,
    pub(crate) starts: Vec<MockStart>,
    pub(crate) force_overlap: u32,
    /// Keeps a queued update out of the running set.
    pub(crate) hold_queued: bool,
    pub(crate) vsyncs: u32,
    overlap_area: Rectangle,
}

impl MockRegistry {
    pub(crate) fn new(capacity: usize, frames: u32) -> Self {
        MockRegistry {
            capacity,
            frames,
            running: Vec::new(),
            queued: None,
            starts: Vec::new(),
            force_overlap: 0,
            hold_queued: false,
            vsyncs: 0,
            overlap_area: Rectangle::zero(),
        }
    }

    pub(crate) fn on_vsync(&mut self) {
        self.vsyncs += 1;
        for pipeline in self.running.iter_mut() {
            pipeline.displayed += 1;
        }
        self.running.retain(|p| !p.retired());
    }
}

impl PipelineRegistry for MockRegistry {
    fn update_pipeline_list(&mut self, _temperature: u32) -> Option<u32> {
        for pipeline in self.running.iter_mut() {
            pipeline.decoded += 1;
        }
        self.running.retain(|p| !p.retired());
        if self.hold_queued {
            return None;
        }
        let queued = self.queued.take()?;
        let frames = queued.frames;
        self.running.push(queued);
        Some(frames)
    }

    fn check_overlap(&mut self, area: Rectangle) {
        self.overlap_area = area;
    }

    fn check_overlap_num(&mut self) -> u32 {
        let area = self.overlap_area;
        let overlapping = self.running.iter().filter(|p| p.overlaps(&area)).count();
        self.force_overlap + overlapping as u32
    }

    fn used_list_status(&mut self) -> bool {
        self.running.len() + usize::from(self.queued.is_some()) >= self.capacity
    }

    fn config_and_enable_one_pipeline(
        &mut self,
        area: Rectangle,
        mode: UpdateMode,
        _temperature: u32,
    ) -> u32 {
        self.starts.push(MockStart {
            area,
            mode,
            vsyncs: self.vsyncs,
        });
        self.running.push(MockPipeline::new(area, mode, self.frames));
        self.frames
    }

    fn config_one_pipeline(&mut self, area: Rectangle, mode: UpdateMode) {
        self.queued = Some(MockPipeline::new(area, mode, self.frames));
    }
}
