//! Rate support and rate control contracts.

use std::sync::Arc;

use crate::descriptor::MediaTypeHandler;
use crate::error::{MediaError, MediaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDirection {
    Forward,
    Reverse,
}

/// Query side of rate negotiation.
pub trait RateSupport: Send + Sync {
    fn slowest_rate(&self, direction: RateDirection, thin: bool) -> MediaResult<f32>;

    fn fastest_rate(&self, direction: RateDirection, thin: bool) -> MediaResult<f32>;

    /// `Ok(rate)` if supported as asked; otherwise
    /// [`MediaError::UnsupportedRate`] with the nearest supported rate.
    fn is_rate_supported(&self, thin: bool, rate: f32) -> MediaResult<f32>;
}

/// Command side of rate negotiation.
pub trait RateControl: Send + Sync {
    fn set_rate(&self, thin: bool, rate: f32) -> MediaResult<()>;

    /// `(thin, rate)` currently in effect.
    fn rate(&self) -> MediaResult<(bool, f32)>;
}

/// Rate support within fixed bounds.
///
/// With a media type handler attached, bounds are only reported once the
/// handler has a current type; until then every query fails with
/// [`MediaError::NotInitialized`].
pub struct BoundedRateSupport {
    handler: Option<Arc<dyn MediaTypeHandler>>,
    slowest: f32,
    fastest: f32,
    reverse: bool,
    thinning: bool,
}

impl BoundedRateSupport {
    pub fn new(slowest: f32, fastest: f32) -> Self {
        Self {
            handler: None,
            slowest,
            fastest,
            reverse: false,
            thinning: false,
        }
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_thinning(mut self, thinning: bool) -> Self {
        self.thinning = thinning;
        self
    }

    /// Gate the bounds on `handler` having a current media type.
    pub fn for_stream(mut self, handler: Arc<dyn MediaTypeHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    fn ready(&self, direction: RateDirection, thin: bool) -> MediaResult<()> {
        if let Some(handler) = &self.handler {
            handler.current_media_type()?;
        }
        if thin && !self.thinning {
            return Err(MediaError::ThinningUnsupported);
        }
        if direction == RateDirection::Reverse && !self.reverse {
            return Err(MediaError::UnsupportedRate { nearest: 0.0 });
        }
        Ok(())
    }
}

impl RateSupport for BoundedRateSupport {
    fn slowest_rate(&self, direction: RateDirection, thin: bool) -> MediaResult<f32> {
        self.ready(direction, thin)?;
        Ok(match direction {
            RateDirection::Forward => self.slowest,
            RateDirection::Reverse => -self.slowest,
        })
    }

    fn fastest_rate(&self, direction: RateDirection, thin: bool) -> MediaResult<f32> {
        self.ready(direction, thin)?;
        Ok(match direction {
            RateDirection::Forward => self.fastest,
            RateDirection::Reverse => -self.fastest,
        })
    }

    fn is_rate_supported(&self, thin: bool, rate: f32) -> MediaResult<f32> {
        let direction = if rate < 0.0 {
            RateDirection::Reverse
        } else {
            RateDirection::Forward
        };
        self.ready(direction, thin)?;

        // Zero is scrubbing, always allowed
        let magnitude = rate.abs();
        if magnitude == 0.0 || (magnitude >= self.slowest && magnitude <= self.fastest) {
            return Ok(rate);
        }
        let nearest = magnitude.clamp(self.slowest, self.fastest).copysign(rate);
        Err(MediaError::UnsupportedRate { nearest })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::StreamTypeHandler;
    use crate::media_type::{subtype, MediaType};

    #[test]
    fn test_bounds() {
        let support = BoundedRateSupport::new(0.5, 4.0);

        assert_eq!(support.slowest_rate(RateDirection::Forward, false).unwrap(), 0.5);
        assert_eq!(support.fastest_rate(RateDirection::Forward, false).unwrap(), 4.0);
        assert_eq!(support.is_rate_supported(false, 2.0).unwrap(), 2.0);
        assert_eq!(support.is_rate_supported(false, 0.0).unwrap(), 0.0);
        assert_eq!(
            support.is_rate_supported(false, 8.0).unwrap_err(),
            MediaError::UnsupportedRate { nearest: 4.0 }
        );
        assert_eq!(
            support.is_rate_supported(true, 1.0).unwrap_err(),
            MediaError::ThinningUnsupported
        );
    }

    #[test]
    fn test_reverse() {
        let forward_only = BoundedRateSupport::new(0.5, 2.0);
        assert!(forward_only.is_rate_supported(false, -1.0).is_err());

        let both = BoundedRateSupport::new(0.5, 2.0).with_reverse(true);
        assert_eq!(both.fastest_rate(RateDirection::Reverse, false).unwrap(), -2.0);
        assert_eq!(
            both.is_rate_supported(false, -3.0).unwrap_err(),
            MediaError::UnsupportedRate { nearest: -2.0 }
        );
    }

    #[test]
    fn test_unset_type_is_not_initialized() {
        let handler = Arc::new(StreamTypeHandler::new(vec![MediaType::audio(subtype::PCM)]));
        let support = BoundedRateSupport::new(0.5, 2.0).for_stream(handler.clone());

        assert_eq!(
            support.fastest_rate(RateDirection::Forward, false).unwrap_err(),
            MediaError::NotInitialized
        );

        handler.set_current_media_type(&MediaType::audio(subtype::PCM)).unwrap();
        assert_eq!(support.fastest_rate(RateDirection::Forward, false).unwrap(), 2.0);
    }
}
