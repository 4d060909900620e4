//! Media sink contracts.

use std::sync::Arc;

use bitflags::bitflags;

use crate::clock::{ClockStateSink, PresentationClock};
use crate::descriptor::MediaTypeHandler;
use crate::error::{MediaError, MediaResult};
use crate::media_type::MediaType;
use crate::rate::RateSupport;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SinkCharacteristics: u32 {
        /// Stream set is fixed; `add_stream_sink` is refused.
        const FIXED_STREAMS = 0x1;
        /// Renders as fast as it is fed and does not care about the rate.
        const RATELESS = 0x2;
    }
}

/// One input stream of a media sink.
pub trait StreamSink: Send + Sync {
    fn media_sink(&self) -> MediaResult<Arc<dyn MediaSink>>;

    fn media_type_handler(&self) -> MediaResult<Arc<dyn MediaTypeHandler>>;

    fn identifier(&self) -> MediaResult<u32>;
}

/// Consumer of one or more streams, driven by the presentation clock.
pub trait MediaSink: Send + Sync {
    fn characteristics(&self) -> MediaResult<SinkCharacteristics>;

    fn stream_sink_count(&self) -> MediaResult<usize>;

    fn stream_sink_by_index(&self, index: usize) -> MediaResult<Arc<dyn StreamSink>>;

    fn stream_sink_by_id(&self, identifier: u32) -> MediaResult<Arc<dyn StreamSink>>;

    /// Dynamic sinks grow a new stream on request.
    fn add_stream_sink(
        &self,
        _identifier: u32,
        _media_type: Option<&MediaType>,
    ) -> MediaResult<Arc<dyn StreamSink>> {
        Err(MediaError::InvalidRequest)
    }

    fn set_presentation_clock(&self, clock: Option<Arc<PresentationClock>>) -> MediaResult<()>;

    /// Receiver of clock notifications for this sink, if it wants them.
    fn clock_state_sink(&self) -> Option<Arc<dyn ClockStateSink>>;

    fn rate_support(&self) -> Option<Arc<dyn RateSupport>> {
        None
    }

    fn shutdown(&self) -> MediaResult<()>;
}

pub(crate) fn same_media_sink(a: &Arc<dyn MediaSink>, b: &Arc<dyn MediaSink>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
