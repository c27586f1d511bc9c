use core::convert::Infallible;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use eink_refresh::{
    config::EinkConfig, image::FlashMode, EinkHw, IndexRequest, IrqStatus, PipelineRegistry,
    UpdateMode,
};
use embassy_time::Instant;
use embedded_graphics::prelude::{Point, Size};
use embedded_graphics::primitives::Rectangle;
use embedded_hal::digital::{ErrorType, OutputPin};
use log::{debug, trace};
use sim_samples::{check_len, Error};

/// Wires between the simulated engine and its interrupt handler.
pub struct EngineLines {
    pending: AtomicU8,
    scanning: AtomicBool,
}

impl EngineLines {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU8::new(0),
            scanning: AtomicBool::new(false),
        }
    }

    fn raise(&self, status: IrqStatus) {
        self.pending.fetch_or(status.bits(), Ordering::AcqRel);
    }

    pub fn irq_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    pub fn scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }
}

pub static LINES: EngineLines = EngineLines::new();

/// Time the panel takes to scan one frame.
pub const FRAME_PERIOD_US: u64 = 2_000;

pub struct PowerPin {
    high: bool,
}

impl ErrorType for PowerPin {
    type Error = Infallible;
}

impl OutputPin for PowerPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        debug!("Panel power off");
        self.high = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        debug!("Panel power on");
        self.high = true;
        Ok(())
    }
}

/// A display engine that computes everything in software.
pub struct SimHw {
    power: PowerPin,
    clock_on: bool,
    output_ready: bool,
    size: Size,
    wavedata_len: usize,
    lines_per_frame: u32,
    dirty: Rectangle,
    frames_out: u32,
}

impl SimHw {
    pub fn new(config: &EinkConfig) -> Self {
        let timing = config.timing;
        Self {
            power: PowerPin { high: false },
            clock_on: false,
            output_ready: false,
            size: Size::new(config.width, config.height),
            wavedata_len: config.wavedata_len(),
            lines_per_frame: config.height + timing.fbl + timing.fsl + timing.fel,
            dirty: Rectangle::zero(),
            frames_out: 0,
        }
    }

    fn require_clock(&self) -> Result<(), Error> {
        if self.clock_on {
            Ok(())
        } else {
            Err(Error::ClockOff)
        }
    }

    fn update_scanning(&self) {
        LINES
            .scanning
            .store(self.power.high && self.output_ready, Ordering::Release);
    }
}

impl EinkHw for SimHw {
    type Power = PowerPin;
    type Error = Error;

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

    fn configure(&mut self, config: &EinkConfig) -> Result<(), Self::Error> {
        self.require_clock()?;
        debug!(
            "Engine configured for {}x{} at {} bits, {:?} bus",
            config.width, config.height, config.bits, config.data_bus
        );
        Ok(())
    }

    fn engine_disable(&mut self) -> Result<(), Self::Error> {
        self.output_ready = false;
        self.update_scanning();
        Ok(())
    }

    fn load_waveform(&mut self) -> Result<(), Self::Error> {
        self.require_clock()?;
        debug!("Waveform tables loaded");
        Ok(())
    }

    fn init_wavedata(&mut self, frame: &mut [u8], config: &EinkConfig) -> Result<(), Self::Error> {
        check_len("wavedata", config.wavedata_len(), frame.len())?;
        // Line sync words at the start of every line.
        let line_len = frame.len() / (config.height as usize + 20);
        for line in frame.chunks_exact_mut(line_len) {
            line[0] = 0x81;
        }
        Ok(())
    }

    fn irq_enable(&mut self) {}

    fn irq_disable(&mut self) {
        LINES.pending.store(0, Ordering::Release);
    }

    fn irq_query(&mut self) -> IrqStatus {
        IrqStatus::from_bits_truncate(LINES.pending.swap(0, Ordering::AcqRel))
    }

    fn convert_image(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(), Self::Error> {
        check_len("ARGB image", dst.len() * 4, src.len())?;
        for (argb, gray) in src.chunks_exact(4).zip(dst.iter_mut()) {
            let luma = (u32::from(argb[1]) * 77 + u32::from(argb[2]) * 150 + u32::from(argb[3]) * 29)
                >> 8;
            *gray = luma as u8;
        }
        Ok(())
    }

    fn start_index(&mut self, request: IndexRequest<'_>) -> Result<(), Self::Error> {
        self.require_clock()?;
        check_len("index", request.current.len(), request.new_index.len())?;

        let width = self.size.width as usize;
        let mut min = Point::new(i32::MAX, i32::MAX);
        let mut max = Point::new(-1, -1);
        for (i, (index, (previous, current))) in request
            .new_index
            .iter_mut()
            .zip(request.previous.iter().zip(request.current))
            .enumerate()
        {
            let changed = previous != current || request.flash != FlashMode::Local;
            *index = (previous & 0xf0) | (current >> 4);
            if changed {
                let point = Point::new((i % width) as i32, (i / width) as i32);
                min = min.component_min(point);
                max = max.component_max(point);
            }
        }
        self.dirty = if max.x < 0 {
            Rectangle::zero()
        } else {
            Rectangle::with_corners(min, max)
        };
        trace!("Index computed, dirty area {:?}", self.dirty);
        LINES.raise(IrqStatus::INDEX_DONE);
        Ok(())
    }

    fn dirty_area(&mut self) -> Rectangle {
        self.dirty
    }

    fn start_decode(
        &mut self,
        index: &[u8],
        wavedata: &mut [u8],
        config: &EinkConfig,
    ) -> Result<(), Self::Error> {
        self.require_clock()?;
        check_len("wavedata", config.wavedata_len(), wavedata.len())?;
        // Four 2-bit drive values per output word.
        for (word, pixels) in wavedata[2..].chunks_exact_mut(2).zip(index.chunks(4)) {
            word[1] = pixels.iter().fold(0, |acc, p| (acc << 2) | (p & 0x3));
        }
        LINES.raise(IrqStatus::DECODE_DONE);
        Ok(())
    }

    fn output_configure(
        &mut self,
        wavedata: &[u8],
        _config: &EinkConfig,
    ) -> Result<(), Self::Error> {
        check_len("wavedata", self.wavedata_len, wavedata.len())?;
        self.output_ready = true;
        self.frames_out += 1;
        self.update_scanning();
        Ok(())
    }

    fn output_set_source(&mut self, wavedata: &[u8]) -> Result<(), Self::Error> {
        check_len("wavedata", self.wavedata_len, wavedata.len())?;
        self.frames_out += 1;
        Ok(())
    }

    fn buffer_ready(&mut self) -> Result<(), Self::Error> {
        trace!("Output frame {} ready", self.frames_out);
        Ok(())
    }

    fn current_line(&mut self) -> u32 {
        let line_us = FRAME_PERIOD_US / u64::from(self.lines_per_frame);
        ((Instant::now().as_micros() / line_us) % u64::from(self.lines_per_frame)) as u32
    }

    fn start_delay(&mut self) -> u32 {
        4
    }

    fn temperature(&mut self) -> Option<u32> {
        Some(24)
    }

    fn panel_timing(&mut self, enable: bool) -> Result<(), Self::Error> {
        if !enable {
            self.output_ready = false;
        }
        self.update_scanning();
        Ok(())
    }
}

struct Pipeline {
    area: Rectangle,
    remaining: u32,
}

/// Runs up to `capacity` pipelines, each for a frame budget that depends on the waveform.
pub struct SimRegistry {
    capacity: usize,
    running: Vec<Pipeline>,
    queued: Option<(Rectangle, UpdateMode)>,
    overlap_area: Rectangle,
}

impl SimRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            running: Vec::new(),
            queued: None,
            overlap_area: Rectangle::zero(),
        }
    }

    fn frames_for(mode: UpdateMode, temperature: u32) -> u32 {
        let frames = match mode {
            UpdateMode::Init => 24,
            UpdateMode::Global => 16,
            UpdateMode::Rect => 8,
        };
        // Cold panels need longer waveforms.
        if temperature < 15 {
            frames + frames / 2
        } else {
            frames
        }
    }
}

impl PipelineRegistry for SimRegistry {
    fn update_pipeline_list(&mut self, temperature: u32) -> Option<u32> {
        for pipeline in self.running.iter_mut() {
            pipeline.remaining = pipeline.remaining.saturating_sub(1);
        }
        self.running.retain(|p| p.remaining > 0);

        let (area, mode) = self.queued.take()?;
        let frames = Self::frames_for(mode, temperature);
        self.running.push(Pipeline {
            area,
            remaining: frames,
        });
        Some(frames)
    }

    fn check_overlap(&mut self, area: Rectangle) {
        self.overlap_area = area;
    }

    fn check_overlap_num(&mut self) -> u32 {
        let area = self.overlap_area;
        self.running
            .iter()
            .filter(|p| !p.area.intersection(&area).is_zero_sized())
            .count() as u32
    }

    fn used_list_status(&mut self) -> bool {
        self.running.len() + usize::from(self.queued.is_some()) >= self.capacity
    }

    fn config_and_enable_one_pipeline(
        &mut self,
        area: Rectangle,
        mode: UpdateMode,
        temperature: u32,
    ) -> u32 {
        let frames = Self::frames_for(mode, temperature);
        self.running.push(Pipeline {
            area,
            remaining: frames,
        });
        frames
    }

    fn config_one_pipeline(&mut self, area: Rectangle, mode: UpdateMode) {
        self.queued = Some((area, mode));
    }
}
