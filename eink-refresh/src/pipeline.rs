use embedded_graphics::primitives::Rectangle;

use crate::image::UpdateMode;

/// Tracks the update pipelines the engine is currently running.
///
/// Each pipeline covers one area of the panel with one waveform, and lasts for a fixed number of
/// frames. The engine decodes all enabled pipelines into every wavedata frame, so a pipeline can be
/// added while another is still running as long as their areas don't overlap.
///
/// All calls are made from within the manager's critical section and must not block.
pub trait PipelineRegistry {
    /// Enables any pipeline queued with [Self::config_one_pipeline] since the last call.
    ///
    /// Returns the number of frames the newly enabled pipeline adds, or `None` if nothing was
    /// queued.
    fn update_pipeline_list(&mut self, temperature: u32) -> Option<u32>;

    /// Records which running pipelines overlap `area`, for [Self::check_overlap_num].
    fn check_overlap(&mut self, area: Rectangle);

    /// The number of running pipelines that overlap the area passed to the last
    /// [Self::check_overlap]. Pipelines that have finished since then are not counted.
    fn check_overlap_num(&mut self) -> u32;

    /// Returns `true` if every pipeline slot is taken.
    fn used_list_status(&mut self) -> bool;

    /// Configures and immediately enables a pipeline, returning its length in frames.
    fn config_and_enable_one_pipeline(
        &mut self,
        area: Rectangle,
        mode: UpdateMode,
        temperature: u32,
    ) -> u32;

    /// Configures a pipeline to be enabled by the next [Self::update_pipeline_list].
    fn config_one_pipeline(&mut self, area: Rectangle, mode: UpdateMode);
}
