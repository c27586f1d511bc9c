use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{with_timeout, Timer};
use embedded_graphics::primitives::Rectangle;

use super::{hardware, EinkManager, Lifecycle};
use crate::{
    config::{OVERLAP_POLL_INTERVAL, SCHEDULER_POLL_INTERVAL},
    image::{ImageQueue, UpdateMode},
    index::IndexRequest,
    log::{debug, error, info, trace, warn_log},
    pipeline::PipelineRegistry,
    EinkHw, EinkUpdate, Error,
};

/// What the scheduler decided to do with a computed image.
enum Plan {
    Started(u32),
    Extended,
    Wait,
}

impl<M, HW, P, const IMAGES: usize, const FRAMES: usize> EinkManager<M, HW, P, IMAGES, FRAMES>
where
    M: RawMutex,
    HW: EinkHw,
    P: PipelineRegistry,
{
    /// Has the engine compute index data for the current image against the previous one.
    ///
    /// On success the result is waiting in the `new` index buffer, to be committed when a pipeline
    /// picks it up. On timeout or engine failure the computation is dropped and the committed
    /// baseline is left alone.
    pub(crate) async fn compute_index(&self, images: &mut ImageQueue<IMAGES>) -> Result<(), Error> {
        self.index_done.reset();
        self.with_shared(|s| {
            s.index.begin().inspect_err(|_| {
                error!("Index buffers diverged before a new computation");
            })?;
            trace!(
                "Computing index {:?} -> {:?}",
                s.index.old(),
                s.index.new_sel()
            );
            let request = IndexRequest::new(&mut s.index, images.previous(), images.current());
            let started = self.with_hw(|hw| hardware(hw.start_index(request)));
            if started.is_err() {
                s.index.abandon();
            }
            started
        })?;

        if with_timeout(self.config.index_timeout, self.index_done.wait())
            .await
            .is_err()
        {
            warn_log!("Timed out waiting for index data");
            self.with_shared(|s| s.index.abandon());
            return Err(Error::Timeout);
        }

        if images.current().auto_area() {
            let area = self.with_hw(|hw| hw.dirty_area());
            trace!("Engine found dirty area {:?}", area);
            images.current_mut().set_area(area);
        }
        self.with_shared(|s| s.index_fresh = true);
        Ok(())
    }

    /// Runs the scheduling loop: computes index data for each queued image, waits out any
    /// overlapping pipeline, and starts the image's pipeline or queues it into the running one.
    ///
    /// Returns once the manager is disabled and no image is pending.
    pub async fn run_detect_fresh(&self) {
        debug!("Scheduling loop started");
        loop {
            let (enabled, index_fresh) =
                self.with_shared(|s| (s.lifecycle == Lifecycle::Enabled, s.index_fresh));
            let mut images = self.images.lock().await;
            if !enabled && images.is_empty() {
                return;
            }
            if !enabled
                || images.is_empty()
                || index_fresh
                || self.with_registry(|r| r.used_list_status())
            {
                drop(images);
                // Any state change signals, the timeout only covers missed notifications.
                let _ = with_timeout(SCHEDULER_POLL_INTERVAL, self.wake.wait()).await;
                continue;
            }

            let temperature = self.temperature();
            let computed = self.compute_index(&mut images).await.map(|()| {
                let current = images.current();
                (current.area(), current.mode())
            });
            // Admissions never touch the current slot while it is pending, so the queue is free
            // to take more images while this one waits for the panel.
            drop(images);

            let scheduled = match computed {
                Ok((area, mode)) => self.schedule(area, mode, temperature).await,
                Err(e) => Err(e),
            };
            match scheduled {
                Ok(()) => {
                    // Only this loop moves the read cursor, so the image is still there.
                    let _ = self.images.lock().await.consume();
                }
                Err(e) => self.abandon_cycle(e),
            }
        }
    }

    async fn schedule(
        &self,
        area: Rectangle,
        mode: UpdateMode,
        temperature: u32,
    ) -> Result<(), Error> {
        self.wait_for_overlap(area).await?;
        self.start_or_extend(area, mode, temperature).await
    }

    /// Waits until no running pipeline overlaps `area`.
    async fn wait_for_overlap(&self, area: Rectangle) -> Result<(), Error> {
        let mut overlaps = self.with_registry(|r| {
            r.check_overlap(area);
            r.check_overlap_num()
        });
        while overlaps > 0 {
            trace!("Update overlaps {} running pipelines", overlaps);
            while !self.with_shared(|s| s.display_finished) {
                if !self.is_enabled() {
                    return Err(Error::Disabled);
                }
                let _ = with_timeout(OVERLAP_POLL_INTERVAL, self.display_done.wait()).await;
            }
            if !self.is_enabled() {
                return Err(Error::Disabled);
            }
            Timer::after(OVERLAP_POLL_INTERVAL).await;
            overlaps = self.with_registry(|r| r.check_overlap_num());
        }
        Ok(())
    }

    /// Starts a new pipeline if none is decoding, otherwise queues the update for the decode worker
    /// to fold in.
    ///
    /// A new pipeline waits for the previous one to finish displaying.
    pub(crate) async fn start_or_extend(
        &self,
        area: Rectangle,
        mode: UpdateMode,
        temperature: u32,
    ) -> Result<(), Error> {
        loop {
            // Deciding under the lock keeps the decode worker from finishing in between.
            let plan = self.with_shared(|s| {
                if s.decoding {
                    self.with_registry(|r| r.config_one_pipeline(area, mode));
                    s.update_queued = true;
                    debug!("Queued {:?} update into the running pipeline", mode);
                    return Plan::Extended;
                }
                if !s.display_finished {
                    // The previous pipeline's frames are still on their way to the panel.
                    return Plan::Wait;
                }
                let frames = self
                    .with_registry(|r| r.config_and_enable_one_pipeline(area, mode, temperature));
                s.decoding = frames > 0;
                s.decode_frame_index = 0;
                s.fresh_frame_index = 0;
                s.display_finished = false;
                s.primed = false;
                s.total_frame = frames;
                s.index.commit();
                s.stats.pipelines_started = s.stats.pipelines_started.saturating_add(1);
                if frames > 0 {
                    info!(
                        "Starting {:?} pipeline of {} frames at {} C",
                        mode, frames, temperature
                    );
                }
                Plan::Started(frames)
            });
            match plan {
                Plan::Wait => {
                    if !self.is_enabled() {
                        return Err(Error::Disabled);
                    }
                    trace!("Waiting for the previous pipeline to finish displaying");
                    let _ = with_timeout(OVERLAP_POLL_INTERVAL, self.display_done.wait()).await;
                }
                Plan::Extended => return Ok(()),
                Plan::Started(0) => {
                    warn_log!("Pipeline has no frames, nothing to decode");
                    self.with_shared(|s| {
                        s.index_fresh = false;
                        s.display_finished = true;
                    });
                    return Ok(());
                }
                Plan::Started(_) => return self.begin_decoding().await,
            }
        }
    }

    async fn begin_decoding(&self) -> Result<(), Error> {
        let started = self.start_decode_when_free(None, true).await;
        if started.is_err() {
            // Nothing will complete this pipeline, so don't let waiters hang on it.
            self.with_shared(|s| {
                s.index_fresh = false;
                s.decoding = false;
                s.total_frame = 0;
                s.display_finished = true;
            });
        }
        started
    }

    /// Cleans up after a scheduling cycle that didn't start or queue its image.
    ///
    /// The image stays at the head of the queue and gets another cycle.
    fn abandon_cycle(&self, error: Error) {
        self.with_shared(|s| {
            s.stats.record(error);
            match error {
                // Nothing will commit a computation left over while no pipeline is decoding.
                Error::InvalidState if !s.decoding => s.index.abandon(),
                Error::InvalidState | Error::Timeout | Error::Hardware => {}
                _ => {
                    if s.index_fresh {
                        s.index_fresh = false;
                        s.index.abandon();
                    }
                }
            }
        });
        match error {
            Error::Disabled => {
                debug!("Scheduling interrupted by disable");
            }
            _ => {
                warn_log!("Scheduling cycle failed: {}", error);
            }
        }
    }
}
