use core::cell::RefCell;
use core::fmt::Debug;

use embassy_futures::join::join3;
use embassy_sync::{
    blocking_mutex::{raw::RawMutex, Mutex as BlockingMutex},
    channel::Channel,
    mutex::Mutex,
    signal::Signal,
};
use embedded_graphics::primitives::Rectangle;
use embedded_hal::digital::OutputPin;

use crate::{
    config::{EinkConfig, DECODE_EVENT_DEPTH, DEFAULT_TEMPERATURE},
    image::{Admission, ImageQueue, UpdateMode},
    index::IndexBuffers,
    log::{debug, info, warn_log},
    pipeline::PipelineRegistry,
    wavedata::WavedataRing,
    EinkHw, EinkUpdate, Error, IrqStatus,
};

mod decode;
mod display;
mod fresh;
mod stats;

pub use stats::Stats;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Disabled,
    Enabling,
    Enabled,
}

/// State shared between the client, the workers and the interrupt path.
pub(crate) struct Shared<const FRAMES: usize> {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) waveform_requested: bool,
    /// Index data has been computed but not yet picked up by a pipeline.
    pub(crate) index_fresh: bool,
    /// A pipeline is being decoded.
    pub(crate) decoding: bool,
    /// An update sits in the registry waiting for the decode worker to fold it in.
    pub(crate) update_queued: bool,
    pub(crate) display_finished: bool,
    /// The panel has been primed for the current pipeline.
    pub(crate) primed: bool,
    pub(crate) temperature_override: Option<u32>,
    pub(crate) total_frame: u32,
    pub(crate) decode_frame_index: u32,
    pub(crate) fresh_frame_index: u32,
    pub(crate) index: IndexBuffers,
    pub(crate) ring: WavedataRing<FRAMES>,
    pub(crate) stats: Stats,
}

impl<const FRAMES: usize> Shared<FRAMES> {
    fn reset_pipeline(&mut self) {
        self.decoding = false;
        self.update_queued = false;
        self.index_fresh = false;
        self.primed = false;
        self.display_finished = true;
        self.total_frame = 0;
        self.decode_frame_index = 0;
        self.fresh_frame_index = 0;
        self.ring.clear();
        self.index.abandon();
    }
}

/// Drives an e-ink engine from queued images to displayed frames.
///
/// `IMAGES` is the capacity of the image queue (at most `IMAGES - 2` images can be pending) and
/// `FRAMES` the number of wavedata frames buffered between the decoder and the output DMA.
///
/// The manager is meant to live for the whole program, shared by reference between the workers and
/// the interrupt handlers, e.g. through a `static_cell::StaticCell`.
pub struct EinkManager<M, HW, P, const IMAGES: usize, const FRAMES: usize>
where
    M: RawMutex,
{
    config: EinkConfig,
    images: Mutex<M, ImageQueue<IMAGES>>,
    shared: BlockingMutex<M, RefCell<Shared<FRAMES>>>,
    hw: BlockingMutex<M, RefCell<HW>>,
    registry: BlockingMutex<M, RefCell<P>>,
    decode_events: Channel<M, (), DECODE_EVENT_DEPTH>,
    index_done: Signal<M, ()>,
    display_done: Signal<M, ()>,
    slot_released: Signal<M, ()>,
    sync_request: Signal<M, ()>,
    panel_off: Signal<M, ()>,
    /// Wakes the scheduling loop.
    wake: Signal<M, ()>,
}

impl<M, HW, P, const IMAGES: usize, const FRAMES: usize> EinkManager<M, HW, P, IMAGES, FRAMES>
where
    M: RawMutex,
    HW: EinkHw,
    P: PipelineRegistry,
{
    /// Allocates every image, index and wavedata buffer and prepares the wavedata control words.
    ///
    /// The engine stays off until [EinkUpdate::enable] is called.
    pub fn new(config: EinkConfig, mut hw: HW, registry: P) -> Result<Self, Error> {
        const { assert!(IMAGES >= 3 && FRAMES >= 2, "Too few image or wavedata slots") };
        let images = ImageQueue::new(&config)?;
        let index = IndexBuffers::new(config.image_len())?;
        let mut ring = WavedataRing::new(config.wavedata_len())?;
        for frame in ring.frames_mut() {
            hardware(hw.init_wavedata(frame, &config))?;
        }
        debug!(
            "Allocated {} images and {} wavedata frames for a {}x{} panel",
            IMAGES,
            FRAMES,
            config.width,
            config.height
        );

        Ok(EinkManager {
            config,
            images: Mutex::new(images),
            shared: BlockingMutex::new(RefCell::new(Shared {
                lifecycle: Lifecycle::Disabled,
                waveform_requested: false,
                index_fresh: false,
                decoding: false,
                update_queued: false,
                display_finished: true,
                primed: false,
                temperature_override: None,
                total_frame: 0,
                decode_frame_index: 0,
                fresh_frame_index: 0,
                index,
                ring,
                stats: Stats::default(),
            })),
            hw: BlockingMutex::new(RefCell::new(hw)),
            registry: BlockingMutex::new(RefCell::new(registry)),
            decode_events: Channel::new(),
            index_done: Signal::new(),
            display_done: Signal::new(),
            slot_released: Signal::new(),
            sync_request: Signal::new(),
            panel_off: Signal::new(),
            wake: Signal::new(),
        })
    }

    pub fn config(&self) -> &EinkConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.with_shared(|s| s.lifecycle == Lifecycle::Enabled)
    }

    /// Counters of pipeline activity and of errors the workers recovered from.
    pub fn stats(&self) -> Stats {
        self.with_shared(|s| s.stats)
    }

    /// Handles the engine interrupt. Safe to call from interrupt context.
    pub fn on_irq(&self) {
        let status = self.with_hw(|hw| hw.irq_query());
        if status.contains(IrqStatus::INDEX_DONE) {
            self.index_done.signal(());
        }
        if status.contains(IrqStatus::DECODE_DONE) && self.decode_events.try_send(()).is_err() {
            warn_log!("Decode event queue full, dropping event");
            self.with_shared(|s| s.stats.dropped_events = s.stats.dropped_events.saturating_add(1));
        }
    }

    /// Runs the scheduling loop, the decode worker and the display worker.
    ///
    /// The scheduling loop parks while the manager is disabled and resumes on the next enable.
    pub async fn run(&self) {
        let scheduler = async {
            loop {
                self.wait_enabled().await;
                self.run_detect_fresh().await;
                debug!("Scheduling loop parked");
            }
        };
        join3(
            scheduler,
            self.run_decode_worker(),
            self.run_display_worker(),
        )
        .await;
    }

    async fn wait_enabled(&self) {
        while !self.is_enabled() {
            self.wake.wait().await;
        }
    }

    pub(crate) fn with_shared<R>(&self, f: impl FnOnce(&mut Shared<FRAMES>) -> R) -> R {
        self.shared.lock(|shared| f(&mut shared.borrow_mut()))
    }

    pub(crate) fn with_hw<R>(&self, f: impl FnOnce(&mut HW) -> R) -> R {
        self.hw.lock(|hw| f(&mut hw.borrow_mut()))
    }

    pub(crate) fn with_registry<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        self.registry.lock(|registry| f(&mut registry.borrow_mut()))
    }

    /// Counts an error a worker is about to drop.
    fn record(&self, error: Error) {
        self.with_shared(|s| s.stats.record(error));
    }

    fn enable_panel(&self) -> Result<(), Error> {
        debug!("Enabling panel");
        self.with_hw(|hw| {
            hardware(hw.power().set_high().map_err(HW::Error::from))?;
            hardware(hw.panel_timing(true))
        })
    }

    fn disable_panel(&self) -> Result<(), Error> {
        // A new pipeline may have been started since the power-down was requested.
        if !self.with_shared(|s| s.display_finished) {
            debug!("Keeping panel on for the next pipeline");
            return Ok(());
        }
        debug!("Disabling panel");
        self.with_hw(|hw| {
            hardware(hw.panel_timing(false))?;
            hardware(hw.power().set_low().map_err(HW::Error::from))
        })
    }
}

impl<M, HW, P, const IMAGES: usize, const FRAMES: usize> EinkUpdate
    for EinkManager<M, HW, P, IMAGES, FRAMES>
where
    M: RawMutex,
    HW: EinkHw,
    P: PipelineRegistry,
{
    fn enable(&self) -> Result<(), Error> {
        let load_waveform = self.with_shared(|s| {
            if s.lifecycle != Lifecycle::Disabled {
                return None;
            }
            s.lifecycle = Lifecycle::Enabling;
            let first = !s.waveform_requested;
            s.waveform_requested = true;
            Some(first)
        });
        let Some(load_waveform) = load_waveform else {
            return Ok(());
        };

        let result = self.with_hw(|hw| -> Result<(), Error> {
            hardware(hw.clock_enable())?;
            hardware(hw.configure(&self.config))?;
            hw.irq_enable();
            if load_waveform {
                // Updates still run with whatever tables the engine has, as before a reload.
                if hardware(hw.load_waveform()).is_err() {
                    warn_log!("Failed to load waveform tables");
                }
            }
            Ok(())
        });

        self.with_shared(|s| {
            s.lifecycle = match result {
                Ok(()) => Lifecycle::Enabled,
                Err(_) => Lifecycle::Disabled,
            }
        });
        result?;
        info!("E-ink manager enabled");
        self.wake.signal(());
        Ok(())
    }

    fn disable(&self) -> Result<(), Error> {
        let was_enabled = self.with_shared(|s| {
            let was_enabled = s.lifecycle == Lifecycle::Enabled;
            if was_enabled {
                s.lifecycle = Lifecycle::Disabled;
                // The engine drops whatever it was working on.
                s.reset_pipeline();
            }
            was_enabled
        });
        if !was_enabled {
            return Ok(());
        }

        let result = self.disable_panel().and(self.with_hw(|hw| {
            hw.irq_disable();
            hardware(hw.engine_disable())?;
            hardware(hw.clock_disable())
        }));
        info!("E-ink manager disabled");
        // Wakes anything waiting so it can notice.
        self.wake.signal(());
        self.display_done.signal(());
        result
    }

    async fn update_image(
        &self,
        image: Option<&[u8]>,
        mode: UpdateMode,
        area: Rectangle,
    ) -> Result<Admission, Error> {
        self.enable()?;

        let admission = {
            let mut images = self.images.lock().await;
            if self.config.convert_input {
                images.admit(
                    image,
                    mode,
                    area,
                    Some(|src: &[u8], dst: &mut [u8]| {
                        self.with_hw(|hw| hardware(hw.convert_image(src, dst)))
                    }),
                )
            } else {
                images.admit(image, mode, area, None::<fn(&[u8], &mut [u8]) -> Result<(), Error>>)
            }
        }?;

        if admission == Admission::Replaced {
            self.with_shared(|s| {
                s.stats.replaced_images = s.stats.replaced_images.saturating_add(1)
            });
        }
        self.wake.signal(());
        Ok(admission)
    }

    fn set_temperature(&self, temperature: u32) {
        self.with_shared(|s| s.temperature_override = Some(temperature));
    }

    fn temperature(&self) -> u32 {
        self.with_shared(|s| s.temperature_override)
            .or_else(|| self.with_hw(|hw| hw.temperature()))
            .unwrap_or(DEFAULT_TEMPERATURE)
    }
}

/// Logs a failed engine call and maps it to [Error::Hardware].
fn hardware<T, E: Debug>(result: Result<T, E>) -> Result<T, Error> {
    result.map_err(|_e| {
        #[cfg(feature = "defmt")]
        defmt::warn!("Engine call failed: {:?}", defmt::Debug2Format(&_e));
        #[cfg(feature = "log")]
        log::warn!("Engine call failed: {:?}", _e);
        Error::Hardware
    })
}
