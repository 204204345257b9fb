//! Capture surface validation and controller negotiation
//!
//! The remote channel records audio from a user-selected capture surface.
//! Only a browser-tab surface with an audio track is acceptable; any other
//! selection must be torn down in full before the error is reported, so no
//! capture indicator is left active.

use super::types::AcquisitionError;
use super::MediaSource;
use tracing::{info, warn};

/// The kind of surface the user selected for capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSurface {
    /// A browser/application tab (the only valid choice for the remote channel)
    BrowserTab,
    /// A single application window
    Window,
    /// An entire monitor
    Monitor,
}

/// Focus handling applied through a negotiated surface controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusBehavior {
    /// Keep focus where it is when capture starts
    NoFocusChange,
    /// Switch focus to the captured surface
    FocusCapturedSurface,
}

/// Optional platform controller for a captured surface
pub trait SurfaceController: Send {
    fn set_focus_behavior(&mut self, behavior: FocusBehavior);
}

/// Result of capability negotiation for the surface controller.
///
/// An explicit tagged variant rather than a runtime probe: platforms that
/// cannot steer focus report `Unsupported` and the capture proceeds without
/// a controller.
pub enum ControllerSupport {
    Supported(Box<dyn SurfaceController>),
    Unsupported,
}

impl std::fmt::Debug for ControllerSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerSupport::Supported(_) => write!(f, "Supported"),
            ControllerSupport::Unsupported => write!(f, "Unsupported"),
        }
    }
}

/// Validate a source acquired for the remote channel.
///
/// On any invalid combination the source's tracks are stopped before the
/// error is returned, and the caller must not open a provider connection.
pub fn validate_remote_source(source: &mut dyn MediaSource) -> Result<(), AcquisitionError> {
    let surface = source.surface();
    let has_audio = source.has_audio();

    if surface == Some(CaptureSurface::BrowserTab) && has_audio {
        info!("Valid capture selection: browser tab with audio");
        return Ok(());
    }

    warn!(
        ?surface,
        has_audio, "Invalid capture selection, stopping acquired tracks"
    );
    source.stop();
    Err(AcquisitionError::InvalidCaptureSurface { surface, has_audio })
}
