//! Presentation and stream descriptors, and the media type handler contract.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{MediaError, MediaResult};
use crate::media_type::MediaType;
use crate::time::MediaTime;

// =============================================================================
// MEDIA TYPE HANDLER
// =============================================================================

/// Per-stream negotiator of the concrete media type in use.
pub trait MediaTypeHandler: Send + Sync {
    /// `Ok(())` if `media_type` can be used on this stream.
    fn is_media_type_supported(&self, media_type: &MediaType) -> MediaResult<()>;

    fn media_type_count(&self) -> MediaResult<usize>;

    /// Candidate type at `index`; [`MediaError::NoMoreTypes`] past the end.
    fn media_type_by_index(&self, index: usize) -> MediaResult<MediaType>;

    fn set_current_media_type(&self, media_type: &MediaType) -> MediaResult<()>;

    fn current_media_type(&self) -> MediaResult<MediaType>;

    fn major_type(&self) -> MediaResult<uuid::Uuid> {
        Ok(self.current_media_type()?.major)
    }
}

/// Default handler: a fixed list of candidate types plus a current type.
///
/// A type is supported when some listed or current type carries only
/// attributes it shares, so an attribute-free entry accepts any format
/// variant of its subtype.
#[derive(Debug)]
pub struct StreamTypeHandler {
    types: Vec<MediaType>,
    current: Mutex<Option<MediaType>>,
}

impl StreamTypeHandler {
    pub fn new(types: Vec<MediaType>) -> Self {
        Self {
            types,
            current: Mutex::new(None),
        }
    }

    /// Handler whose only candidate is also the current type.
    pub fn with_current(media_type: MediaType) -> Self {
        Self {
            types: vec![media_type.clone()],
            current: Mutex::new(Some(media_type)),
        }
    }
}

impl MediaTypeHandler for StreamTypeHandler {
    fn is_media_type_supported(&self, media_type: &MediaType) -> MediaResult<()> {
        let current = self.current.lock();
        let known = current.iter().chain(self.types.iter());
        for candidate in known {
            if candidate.matches_items(media_type) {
                return Ok(());
            }
        }
        Err(MediaError::InvalidMediaType)
    }

    fn media_type_count(&self) -> MediaResult<usize> {
        Ok(self.types.len())
    }

    fn media_type_by_index(&self, index: usize) -> MediaResult<MediaType> {
        self.types.get(index).cloned().ok_or(MediaError::NoMoreTypes)
    }

    fn set_current_media_type(&self, media_type: &MediaType) -> MediaResult<()> {
        debug!("stream type set to {}", media_type);
        *self.current.lock() = Some(media_type.clone());
        Ok(())
    }

    fn current_media_type(&self) -> MediaResult<MediaType> {
        self.current.lock().clone().ok_or(MediaError::NotInitialized)
    }

    fn major_type(&self) -> MediaResult<uuid::Uuid> {
        if let Some(current) = self.current.lock().as_ref() {
            return Ok(current.major);
        }
        self.types
            .first()
            .map(|t| t.major)
            .ok_or(MediaError::NotInitialized)
    }
}

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// One stream of a presentation.
#[derive(Clone)]
pub struct StreamDescriptor {
    identifier: u32,
    handler: Arc<dyn MediaTypeHandler>,
}

impl StreamDescriptor {
    pub fn new(identifier: u32, handler: Arc<dyn MediaTypeHandler>) -> Self {
        Self { identifier, handler }
    }

    /// Descriptor with a [`StreamTypeHandler`] over `types`.
    pub fn with_types(identifier: u32, types: Vec<MediaType>) -> Self {
        Self::new(identifier, Arc::new(StreamTypeHandler::new(types)))
    }

    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    pub fn media_type_handler(&self) -> Arc<dyn MediaTypeHandler> {
        Arc::clone(&self.handler)
    }
}

impl std::fmt::Debug for StreamDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDescriptor")
            .field("identifier", &self.identifier)
            .finish()
    }
}

#[derive(Debug)]
struct PresentationState {
    selected: Vec<bool>,
    duration: Option<MediaTime>,
}

/// The streams a source offers and which of them are selected.
///
/// Shared between the source, the topology and the session; selection is
/// interior-mutable.
#[derive(Debug)]
pub struct PresentationDescriptor {
    streams: Vec<StreamDescriptor>,
    state: Mutex<PresentationState>,
}

impl PresentationDescriptor {
    /// All streams start deselected.
    pub fn new(streams: Vec<StreamDescriptor>) -> Self {
        let count = streams.len();
        Self {
            streams,
            state: Mutex::new(PresentationState {
                selected: vec![false; count],
                duration: None,
            }),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Stream at `index` with its selection flag.
    pub fn stream_by_index(&self, index: usize) -> MediaResult<(bool, StreamDescriptor)> {
        let stream = self
            .streams
            .get(index)
            .ok_or(MediaError::InvalidArgument("stream index out of range"))?;
        Ok((self.state.lock().selected[index], stream.clone()))
    }

    pub fn stream_by_id(&self, identifier: u32) -> Option<(usize, StreamDescriptor)> {
        self.streams
            .iter()
            .position(|s| s.identifier == identifier)
            .map(|i| (i, self.streams[i].clone()))
    }

    pub fn select_stream(&self, index: usize) -> MediaResult<()> {
        self.set_selected(index, true)
    }

    pub fn deselect_stream(&self, index: usize) -> MediaResult<()> {
        self.set_selected(index, false)
    }

    fn set_selected(&self, index: usize, selected: bool) -> MediaResult<()> {
        let mut state = self.state.lock();
        let flag = state
            .selected
            .get_mut(index)
            .ok_or(MediaError::InvalidArgument("stream index out of range"))?;
        *flag = selected;
        Ok(())
    }

    /// Whether the stream with this identifier is selected.
    pub fn is_selected(&self, identifier: u32) -> bool {
        match self.streams.iter().position(|s| s.identifier == identifier) {
            Some(index) => self.state.lock().selected[index],
            None => false,
        }
    }

    pub fn selected_streams(&self) -> Vec<StreamDescriptor> {
        let state = self.state.lock();
        self.streams
            .iter()
            .zip(state.selected.iter())
            .filter(|(_, selected)| **selected)
            .map(|(stream, _)| stream.clone())
            .collect()
    }

    pub fn duration(&self) -> Option<MediaTime> {
        self.state.lock().duration
    }

    pub fn set_duration(&self, duration: Option<MediaTime>) {
        self.state.lock().duration = duration;
    }

    /// Independent copy of the selection state sharing the same streams.
    pub fn clone_descriptor(&self) -> PresentationDescriptor {
        let state = self.state.lock();
        PresentationDescriptor {
            streams: self.streams.clone(),
            state: Mutex::new(PresentationState {
                selected: state.selected.clone(),
                duration: state.duration,
            }),
        }
    }
}
