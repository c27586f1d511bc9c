use embassy_futures::{
    select::{select, Either},
    yield_now,
};
use embassy_sync::blocking_mutex::raw::RawMutex;

use super::{hardware, EinkManager};
use crate::{
    log::{debug, trace, warn_log},
    pipeline::PipelineRegistry,
    EinkHw, Error,
};

enum FrameEvent {
    Idle,
    Next,
    Last,
    Finished,
}

impl<M, HW, P, const IMAGES: usize, const FRAMES: usize> EinkManager<M, HW, P, IMAGES, FRAMES>
where
    M: RawMutex,
    HW: EinkHw,
    P: PipelineRegistry,
{
    /// Handles the end of a displayed frame. Safe to call from interrupt context.
    ///
    /// Once the pipeline's last frame has been shown, this resets the display state and asks for
    /// the panel to be switched off.
    pub fn on_frame_displayed(&self) {
        let event = self.with_shared(|s| {
            if s.display_finished {
                return FrameEvent::Idle;
            }
            s.fresh_frame_index += 1;
            s.stats.frames_displayed = s.stats.frames_displayed.saturating_add(1);
            if s.fresh_frame_index >= s.total_frame {
                s.fresh_frame_index = 0;
                s.ring.clear();
                s.display_finished = true;
                FrameEvent::Finished
            } else if s.fresh_frame_index + 1 == s.total_frame {
                // The last frame is already in the output's shadow register.
                FrameEvent::Last
            } else {
                FrameEvent::Next
            }
        });

        match event {
            FrameEvent::Idle => {
                trace!("Frame displayed outside a pipeline");
            }
            FrameEvent::Next => self.sync_request.signal(()),
            FrameEvent::Last => {}
            FrameEvent::Finished => {
                debug!("Pipeline display finished");
                self.display_done.signal(());
                self.panel_off.signal(());
                self.wake.signal(());
            }
        }
    }

    /// Runs the display worker, which feeds each new frame to the output DMA and powers the panel
    /// down after the last one.
    pub async fn run_display_worker(&self) {
        debug!("Display worker started");
        loop {
            let result = match select(self.sync_request.wait(), self.panel_off.wait()).await {
                Either::First(()) => self.sync_on_scanline().await,
                Either::Second(()) => self.disable_panel(),
            };
            if let Err(e) = result {
                match e {
                    Error::Busy => {
                        warn_log!("No wavedata ready for the next frame");
                    }
                    _ => {
                        warn_log!("Display update failed: {}", e);
                    }
                }
                self.record(e);
            }
        }
    }

    /// Waits until the panel scan has passed the safe-swap line, then pushes the next frame.
    pub async fn sync_on_scanline(&self) -> Result<(), Error> {
        let start_delay = self.with_hw(|hw| hw.start_delay());
        while self.with_hw(|hw| hw.current_line()) < start_delay {
            yield_now().await;
        }
        self.push_ready_frame()
    }

    /// Hands the oldest decoded frame to the output DMA and frees its slot.
    ///
    /// Returns [Error::Busy] if nothing has been decoded.
    pub fn push_ready_frame(&self) -> Result<(), Error> {
        self.push_frame(false)
    }

    /// Like [Self::push_ready_frame], but fully configures the output first. Used for the first
    /// frame of a pipeline.
    pub(crate) fn prime_output(&self) -> Result<(), Error> {
        self.push_frame(true)
    }

    fn push_frame(&self, configure: bool) -> Result<(), Error> {
        self.with_shared(|s| {
            let Some(frame) = s.ring.display_source() else {
                trace!("No wavedata to push");
                return Err(Error::Busy);
            };
            self.with_hw(|hw| {
                if configure {
                    hardware(hw.output_configure(frame, &self.config))?;
                } else {
                    hardware(hw.output_set_source(frame))?;
                }
                hardware(hw.buffer_ready())
            })?;
            trace!("Pushed wavedata slot {}", s.ring.tail());
            s.ring.release()
        })?;
        self.slot_released.signal(());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::mock::{test_manager, PIPELINE_FRAMES};

    fn fill_ring<const I: usize, const F: usize>(
        manager: &crate::mock::TestManager<I, F>,
        frames: u8,
    ) {
        manager.with_shared(|s| {
            for n in 0..frames {
                s.ring.decode_target().unwrap()[0] = n;
                s.ring.commit().unwrap();
            }
        });
    }

    fn start_display<const I: usize, const F: usize>(
        manager: &crate::mock::TestManager<I, F>,
        total: u32,
    ) {
        manager.with_shared(|s| {
            s.total_frame = total;
            s.display_finished = false;
        });
    }

    #[test]
    fn test_push_on_empty_ring_is_busy() {
        let manager = test_manager::<4, 8>(PIPELINE_FRAMES);
        assert_eq!(manager.push_ready_frame(), Err(Error::Busy));
        manager.with_hw(|hw| assert_eq!(hw.buffer_ready, 0));
    }

    #[test]
    fn test_push_hands_out_frames_in_order() {
        let manager = test_manager::<4, 8>(PIPELINE_FRAMES);
        fill_ring(&manager, 3);

        manager.prime_output().unwrap();
        manager.push_ready_frame().unwrap();
        manager.push_ready_frame().unwrap();

        manager.with_hw(|hw| {
            assert_eq!(hw.output_configs, 1);
            assert_eq!(hw.outputs, 2);
            assert_eq!(hw.buffer_ready, 3);
            assert_eq!(hw.sources, [0, 1, 2]);
        });
        manager.with_shared(|s| assert!(s.ring.is_empty()));
        assert!(manager.slot_released.signaled());
    }

    #[test]
    fn test_sync_waits_for_safe_line() {
        let manager = test_manager::<4, 8>(PIPELINE_FRAMES);
        fill_ring(&manager, 1);
        manager.with_hw(|hw| {
            hw.line = 0;
            hw.start_delay = 6;
        });

        block_on(manager.sync_on_scanline()).unwrap();

        manager.with_hw(|hw| {
            assert!(hw.line >= 6);
            assert_eq!(hw.outputs, 1);
        });
    }

    #[test]
    fn test_sync_requests_until_last_frame() {
        let manager = test_manager::<4, 8>(PIPELINE_FRAMES);
        start_display(&manager, 4);

        let mut requested = [false; 3];
        for request in requested.iter_mut() {
            manager.on_frame_displayed();
            *request = manager.sync_request.signaled();
            manager.sync_request.reset();
        }
        assert_eq!(requested, [true, true, false]);
        assert!(!manager.display_done.signaled());
    }

    #[test]
    fn test_budget_of_displayed_frames_ends_pipeline() {
        let manager = test_manager::<4, 8>(PIPELINE_FRAMES);
        fill_ring(&manager, 3);
        start_display(&manager, 5);

        for _ in 0..5 {
            manager.on_frame_displayed();
        }

        manager.with_shared(|s| {
            assert_eq!(s.fresh_frame_index, 0);
            assert!(s.ring.is_empty());
            assert!(s.display_finished);
            assert_eq!(s.stats.frames_displayed, 5);
        });
        assert!(manager.display_done.signaled());
        assert!(manager.panel_off.signaled());
    }

    #[test]
    fn test_frames_outside_pipeline_are_ignored() {
        let manager = test_manager::<4, 8>(PIPELINE_FRAMES);
        manager.on_frame_displayed();
        manager.with_shared(|s| {
            assert_eq!(s.fresh_frame_index, 0);
            assert_eq!(s.stats.frames_displayed, 0);
        });
        assert!(!manager.sync_request.signaled());
    }
}
