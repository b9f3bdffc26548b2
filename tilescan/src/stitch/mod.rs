//! Interface to the external stitcher.
//!
//! The engine produces an ordered grid of per-stream raw frames; the
//! registration and weaving algorithms that merge them live outside this
//! crate. This module defines the trait boundary, the closed method
//! identifiers, and the degraded-result type for the identity-registration
//! fallback.

use thiserror::Error;

use crate::frame::Frame;

/// Registration method identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationMethod {
    /// Estimate one global shift per tile from the overlap regions.
    #[default]
    GlobalShift,
    /// Trust the recorded stage positions as-is.
    Identity,
}

/// Weaving method identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeavingMethod {
    /// Average overlapping pixels.
    #[default]
    Mean,
}

/// Errors reported by a stitcher implementation.
#[derive(Debug, Error)]
pub enum StitchError {
    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("weaving failed: {0}")]
    WeavingFailed(String),
}

/// How the tiles ended up being registered.
///
/// A registration failure is not fatal: the engine retries with the
/// identity registrar, which trusts stage positions. Callers can tell a
/// clean run from a degraded one without digging through logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The requested registration method succeeded.
    Registered,
    /// The requested method failed and the identity fallback was used.
    IdentityFallback {
        /// Why the requested method was abandoned.
        reason: String,
    },
}

impl RegistrationOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::IdentityFallback { .. })
    }
}

/// External registration/weaving implementation.
///
/// `tiles` is indexed `[tile][stream]`, tiles in acquisition order with the
/// per-tile frames already sorted so the stitching leader comes first.
pub trait Stitcher: Send + Sync + 'static {
    /// Aligns the tiles, returning them with corrected positions in the
    /// same `[tile][stream]` layout.
    fn register(
        &self,
        tiles: &[Vec<Frame>],
        method: RegistrationMethod,
    ) -> Result<Vec<Vec<Frame>>, StitchError>;

    /// Merges one stream's registered tiles into a single frame.
    fn weave(&self, tiles: Vec<Frame>, method: WeavingMethod) -> Result<Frame, StitchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_degraded() {
        assert!(!RegistrationOutcome::Registered.is_degraded());
        assert!(RegistrationOutcome::IdentityFallback {
            reason: "overlap too small".into()
        }
        .is_degraded());
    }
}
