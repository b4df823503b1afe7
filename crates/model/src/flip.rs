use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::timings::Size;

pub const MAX_LAYERS_PER_HEAD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SurfaceFormat {
    A8R8G8B8,
    X8R8G8B8,
    A2B10G10R10,
    R16G16B16A16F,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransferFunction {
    #[default]
    Sdr,
    Pq,
    Hlg,
}

impl TransferFunction {
    pub const fn is_hdr(self) -> bool {
        matches!(self, TransferFunction::Pq | TransferFunction::Hlg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceDesc {
    pub size: Size,
    pub format: SurfaceFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LayerFlip {
    pub surface: Option<SurfaceDesc>,
    pub tearing: bool,
}

/// Per-layer scanout state of one physical head.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FlipState {
    pub layers: SmallVec<[LayerFlip; 4]>,
    pub transfer_function: TransferFunction,
    pub dirty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlipError {
    #[error("flip names {count} layers but at most {max} are supported")]
    TooManyLayers { count: usize, max: usize },
    #[error("layer {layer} has an empty surface")]
    EmptySurface { layer: usize },
    #[error("layer {layer} surface {surface:?} exceeds viewport input {viewport:?}")]
    SurfaceExceedsViewport {
        layer: usize,
        surface: Size,
        viewport: Size,
    },
}

impl FlipState {
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Checks that hold regardless of timings or head assignment.
    pub fn check_structure(&self) -> Result<(), FlipError> {
        if self.layers.len() > MAX_LAYERS_PER_HEAD {
            return Err(FlipError::TooManyLayers {
                count: self.layers.len(),
                max: MAX_LAYERS_PER_HEAD,
            });
        }
        for (layer, flip) in self.layers.iter().enumerate() {
            if let Some(surface) = flip.surface
                && surface.size.is_empty()
            {
                return Err(FlipError::EmptySurface { layer });
            }
        }
        Ok(())
    }

    pub fn check_against_viewport(&self, viewport_in: Size) -> Result<(), FlipError> {
        for (layer, flip) in self.layers.iter().enumerate() {
            let Some(surface) = flip.surface else {
                continue;
            };
            if surface.size.width > viewport_in.width || surface.size.height > viewport_in.height {
                return Err(FlipError::SurfaceExceedsViewport {
                    layer,
                    surface: surface.size,
                    viewport: viewport_in,
                });
            }
        }
        Ok(())
    }
}

/// Input LUT index window. `depth` is the entry precision in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputLut {
    pub depth: u8,
    pub start: u16,
    pub end: u16,
}

impl InputLut {
    pub const MAX_ENTRIES: u16 = 1025;

    pub fn is_valid(&self) -> bool {
        matches!(self.depth, 8 | 15 | 16) && self.start <= self.end && self.end < Self::MAX_ENTRIES
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LutState {
    pub input: Option<InputLut>,
    pub output_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HdrStaticMetadata {
    pub max_display_luminance: u16,
    pub min_display_luminance: u16,
    pub max_content_light_level: u16,
    pub max_frame_average_light_level: u16,
}
