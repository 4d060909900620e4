//! Media source contract.

use std::sync::Arc;

use bitflags::bitflags;

use crate::descriptor::PresentationDescriptor;
use crate::error::MediaResult;
use crate::event::MediaEventGenerator;
use crate::time::{StartPosition, TimeFormat};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SourceCharacteristics: u32 {
        const IS_LIVE = 0x1;
        const CAN_SEEK = 0x2;
        const CAN_PAUSE = 0x4;
        const HAS_SLOW_SEEK = 0x8;
    }
}

/// Produces streams and reports its transport state through its own event
/// queue: `SourceStarted`/`SourceSeeked`, `SourcePaused`, `SourceStopped`
/// and `EndOfPresentation`.
///
/// `start`, `pause` and `stop` return as soon as the request is accepted;
/// completion arrives as an event. A synchronous error means the request
/// was rejected outright.
pub trait MediaSource: MediaEventGenerator {
    fn characteristics(&self) -> MediaResult<SourceCharacteristics>;

    fn create_presentation_descriptor(&self) -> MediaResult<Arc<PresentationDescriptor>>;

    fn start(
        &self,
        descriptor: &PresentationDescriptor,
        time_format: TimeFormat,
        position: StartPosition,
    ) -> MediaResult<()>;

    fn stop(&self) -> MediaResult<()>;

    fn pause(&self) -> MediaResult<()>;

    fn shutdown(&self) -> MediaResult<()>;
}

pub(crate) fn same_source(a: &Arc<dyn MediaSource>, b: &Arc<dyn MediaSource>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
