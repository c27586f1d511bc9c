use crate::Error;

/// Running counters kept by an [crate::EinkManager].
///
/// The workers don't stop on errors; they log them, count them here and carry on with the next
/// event.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub pipelines_started: u32,
    pub frames_decoded: u32,
    pub frames_displayed: u32,
    /// Images that overwrote the spare queue slot because the queue was full.
    pub replaced_images: u32,
    pub index_timeouts: u32,
    pub invalid_states: u32,
    /// Decode steps abandoned because no wavedata slot came free.
    pub wavedata_starved: u32,
    /// Frames that had nothing decoded to show.
    pub underruns: u32,
    pub hardware_errors: u32,
    /// Decode interrupts lost to a full event queue.
    pub dropped_events: u32,
}

impl Stats {
    pub(crate) fn record(&mut self, error: Error) {
        let counter = match error {
            Error::Timeout => &mut self.index_timeouts,
            Error::InvalidState => &mut self.invalid_states,
            Error::ResourceExhausted => &mut self.wavedata_starved,
            Error::Busy => &mut self.underruns,
            Error::Hardware => &mut self.hardware_errors,
            Error::OutOfMemory | Error::InvalidArgument | Error::Disabled => return,
        };
        *counter = counter.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_routes_errors() {
        let mut stats = Stats::default();
        stats.record(Error::Timeout);
        stats.record(Error::Timeout);
        stats.record(Error::Busy);
        stats.record(Error::Disabled);
        assert_eq!(stats.index_timeouts, 2);
        assert_eq!(stats.underruns, 1);
        assert_eq!(
            stats,
            Stats {
                index_timeouts: 2,
                underruns: 1,
                ..Stats::default()
            }
        );
    }
}
