//! Transform contract and the registry the resolver draws converters and
//! decoders from.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{MediaError, MediaResult};
use crate::media_type::MediaType;

/// Type negotiation surface of a converter or decoder.
pub trait Transform: Send + Sync {
    /// Preferred input type at `index`; [`MediaError::NoMoreTypes`] past the end.
    fn input_available_type(&self, stream: u32, index: usize) -> MediaResult<MediaType>;

    /// Output type at `index` given the input type set so far.
    fn output_available_type(&self, stream: u32, index: usize) -> MediaResult<MediaType>;

    fn set_input_type(&self, stream: u32, media_type: &MediaType) -> MediaResult<()>;

    fn set_output_type(&self, stream: u32, media_type: &MediaType) -> MediaResult<()>;

    /// [`MediaError::TypeNotSet`] until an input type is set.
    fn input_current_type(&self, stream: u32) -> MediaResult<MediaType>;

    fn output_current_type(&self, stream: u32) -> MediaResult<MediaType>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformCategory {
    Decoder,
    Converter,
}

/// Major type and subtype a transform accepts or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub major: Uuid,
    pub subtype: Uuid,
}

impl TypeInfo {
    pub fn new(major: Uuid, subtype: Uuid) -> Self {
        Self { major, subtype }
    }

    pub fn matches(&self, media_type: &MediaType) -> bool {
        self.major == media_type.major && self.subtype == media_type.subtype
    }
}

impl From<&MediaType> for TypeInfo {
    fn from(media_type: &MediaType) -> Self {
        Self::new(media_type.major, media_type.subtype)
    }
}

pub type TransformFactory = Arc<dyn Fn() -> MediaResult<Arc<dyn Transform>> + Send + Sync>;

/// One registered transform.
pub struct TransformRegistration {
    pub name: String,
    pub category: TransformCategory,
    pub inputs: Vec<TypeInfo>,
    pub outputs: Vec<TypeInfo>,
    factory: TransformFactory,
}

impl TransformRegistration {
    pub fn new(
        name: &str,
        category: TransformCategory,
        inputs: Vec<TypeInfo>,
        outputs: Vec<TypeInfo>,
        factory: TransformFactory,
    ) -> Self {
        Self {
            name: name.to_string(),
            category,
            inputs,
            outputs,
            factory,
        }
    }

    pub fn accepts(&self, media_type: &MediaType) -> bool {
        self.inputs.iter().any(|info| info.matches(media_type))
    }

    pub fn create(&self) -> MediaResult<Arc<dyn Transform>> {
        (self.factory)()
    }
}

impl fmt::Debug for TransformRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRegistration")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

/// Catalogue of transforms available for insertion.
#[derive(Debug, Default)]
pub struct TransformRegistry {
    registrations: RwLock<Vec<Arc<TransformRegistration>>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, registration: TransformRegistration) {
        debug!(
            "registered {:?} transform {}",
            registration.category, registration.name
        );
        self.registrations.write().push(Arc::new(registration));
    }

    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.read().is_empty()
    }

    /// Transforms of `category` accepting `input`, in registration order.
    pub fn find(&self, category: TransformCategory, input: &MediaType) -> Vec<Arc<TransformRegistration>> {
        self.registrations
            .read()
            .iter()
            .filter(|r| r.category == category && r.accepts(input))
            .cloned()
            .collect()
    }
}

// =============================================================================
// TABLE TRANSFORM
// =============================================================================

#[derive(Debug, Default)]
struct TableState {
    input: Option<MediaType>,
    output: Option<MediaType>,
}

/// Transform described entirely by its input and output type tables.
///
/// Useful for converters whose processing lives elsewhere and which only
/// take part in negotiation. Single stream, id 0.
#[derive(Debug)]
pub struct TableTransform {
    inputs: Vec<MediaType>,
    outputs: Vec<MediaType>,
    state: Mutex<TableState>,
}

impl TableTransform {
    pub fn new(inputs: Vec<MediaType>, outputs: Vec<MediaType>) -> Self {
        Self {
            inputs,
            outputs,
            state: Mutex::new(TableState::default()),
        }
    }

    fn check_stream(stream: u32) -> MediaResult<()> {
        if stream != 0 {
            return Err(MediaError::InvalidArgument("unknown stream id"));
        }
        Ok(())
    }
}

impl Transform for TableTransform {
    fn input_available_type(&self, stream: u32, index: usize) -> MediaResult<MediaType> {
        Self::check_stream(stream)?;
        self.inputs.get(index).cloned().ok_or(MediaError::NoMoreTypes)
    }

    fn output_available_type(&self, stream: u32, index: usize) -> MediaResult<MediaType> {
        Self::check_stream(stream)?;
        if self.state.lock().input.is_none() {
            return Err(MediaError::TypeNotSet);
        }
        self.outputs.get(index).cloned().ok_or(MediaError::NoMoreTypes)
    }

    fn set_input_type(&self, stream: u32, media_type: &MediaType) -> MediaResult<()> {
        Self::check_stream(stream)?;
        if !self.inputs.iter().any(|t| t.same_format(media_type)) {
            return Err(MediaError::InvalidMediaType);
        }
        self.state.lock().input = Some(media_type.clone());
        Ok(())
    }

    fn set_output_type(&self, stream: u32, media_type: &MediaType) -> MediaResult<()> {
        Self::check_stream(stream)?;
        if !self.outputs.iter().any(|t| t.same_format(media_type)) {
            return Err(MediaError::InvalidMediaType);
        }
        self.state.lock().output = Some(media_type.clone());
        Ok(())
    }

    fn input_current_type(&self, stream: u32) -> MediaResult<MediaType> {
        Self::check_stream(stream)?;
        self.state.lock().input.clone().ok_or(MediaError::TypeNotSet)
    }

    fn output_current_type(&self, stream: u32) -> MediaResult<MediaType> {
        Self::check_stream(stream)?;
        self.state.lock().output.clone().ok_or(MediaError::TypeNotSet)
    }
}
