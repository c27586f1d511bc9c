use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::with_timeout;

use super::{hardware, EinkManager};
use crate::{
    config::{WAVEDATA_RETRIES, WAVEDATA_RETRY_INTERVAL},
    log::{debug, trace, warn_log},
    pipeline::PipelineRegistry,
    EinkHw, EinkUpdate, Error,
};

/// What a decode-complete event did to the running pipeline.
struct DecodeStep {
    inserted: bool,
    finished: bool,
    prime: bool,
}

impl<M, HW, P, const IMAGES: usize, const FRAMES: usize> EinkManager<M, HW, P, IMAGES, FRAMES>
where
    M: RawMutex,
    HW: EinkHw,
    P: PipelineRegistry,
{
    /// Runs the decode worker, which advances the running pipeline by one frame for every
    /// decode-complete interrupt.
    pub async fn run_decode_worker(&self) {
        debug!("Decode worker started");
        loop {
            self.decode_events.receive().await;
            if !self.is_enabled() {
                trace!("Dropping decode event while disabled");
                continue;
            }
            if let Err(e) = self.decode_step().await {
                warn_log!("Decode step failed: {}", e);
                self.record(e);
            }
            self.wake.signal(());
        }
    }

    /// Handles one decode-complete event.
    pub(crate) async fn decode_step(&self) -> Result<(), Error> {
        let temperature = self.temperature();
        let step = self.with_shared(|s| {
            if !s.decoding {
                return None;
            }
            if s.ring.commit().is_err() {
                warn_log!("Decoded frame landed in a full wavedata ring");
            }

            let inserted = self.with_registry(|r| r.update_pipeline_list(temperature));
            if let Some(frames) = inserted {
                s.total_frame = s.total_frame.saturating_add(frames);
                s.update_queued = false;
            }
            let frame = s.decode_frame_index;
            trace!("Decoded frame {}", frame);
            s.decode_frame_index += 1;
            s.stats.frames_decoded = s.stats.frames_decoded.saturating_add(1);

            let finished = s.decode_frame_index >= s.total_frame;
            if finished {
                if s.update_queued {
                    // Left to the registry for the next pipeline.
                    s.index.commit();
                    s.update_queued = false;
                }
                s.decoding = false;
                s.decode_frame_index = 0;
                s.index_fresh = false;
            } else if inserted.is_some() {
                s.index.commit();
            }
            // Short pipelines never reach the priming frame, so they prime on their last one.
            let prime = !s.primed && (frame == self.config.priming_frame || finished);
            if prime {
                s.primed = true;
            }
            Some(DecodeStep {
                inserted: inserted.is_some(),
                finished,
                prime,
            })
        });
        let Some(step) = step else {
            trace!("Ignoring decode event outside a pipeline");
            return Ok(());
        };
        if step.inserted {
            debug!("Folded a queued update into the running pipeline");
        }

        if step.prime {
            if let Err(e) = self.prime_panel().await {
                warn_log!("Failed to prime the panel: {}", e);
                self.record(e);
            }
        }
        if step.finished {
            debug!("Pipeline decoding finished");
            return Ok(());
        }

        let next = self
            .start_decode_when_free(Some(WAVEDATA_RETRIES), step.inserted)
            .await;
        if next.is_err() {
            self.end_starved_pipeline();
        }
        next
    }

    /// Ends a pipeline whose next frame could not be decoded, since no further decode event will
    /// arrive for it.
    ///
    /// The display only waits for the frames already decoded. If the panel was never primed
    /// nothing will show them, so the pipeline is finished on the spot.
    fn end_starved_pipeline(&self) {
        let unprimed = self.with_shared(|s| {
            s.decoding = false;
            s.total_frame = s.decode_frame_index;
            s.decode_frame_index = 0;
            s.index_fresh = false;
            if s.update_queued {
                // The registry keeps the queued update for the next pipeline, which decodes
                // against this index.
                s.index.commit();
                s.update_queued = false;
            }
            if s.primed {
                return false;
            }
            s.fresh_frame_index = 0;
            s.ring.clear();
            s.display_finished = true;
            true
        });
        if unprimed {
            debug!("Dropping frames of a pipeline that never reached the panel");
            self.display_done.signal(());
            self.panel_off.signal(());
        }
    }

    /// Starts decoding the committed index data into the next free wavedata slot.
    ///
    /// With `attempts`, gives up with [Error::ResourceExhausted] after that many tries; otherwise
    /// waits for as long as the manager stays enabled.
    pub(crate) async fn start_decode_when_free(
        &self,
        attempts: Option<u32>,
        clear_fresh: bool,
    ) -> Result<(), Error> {
        let mut attempt = 0;
        loop {
            let started = self.with_shared(|s| -> Result<bool, Error> {
                let Some(target) = s.ring.decode_target() else {
                    return Ok(false);
                };
                let index = s.index.committed();
                self.with_hw(|hw| hardware(hw.start_decode(index, target, &self.config)))?;
                if clear_fresh {
                    s.index_fresh = false;
                }
                Ok(true)
            })?;
            if started {
                return Ok(());
            }

            attempt += 1;
            match attempts {
                Some(max) if attempt >= max => {
                    warn_log!("No wavedata slot freed after {} attempts", attempt);
                    return Err(Error::ResourceExhausted);
                }
                None if !self.is_enabled() => return Err(Error::Disabled),
                _ => {}
            }
            trace!("Waiting for a free wavedata slot");
            let _ = with_timeout(WAVEDATA_RETRY_INTERVAL, self.slot_released.wait()).await;
        }
    }

    /// Pushes the first buffered frames to the output and switches the panel on.
    async fn prime_panel(&self) -> Result<(), Error> {
        debug!("Priming panel output");
        self.prime_output()?;
        self.enable_panel()?;
        match self.sync_on_scanline().await {
            // A single-frame pipeline has nothing more to push.
            Err(Error::Busy) => Ok(()),
            result => result,
        }
    }
}
