use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::color::{ColorSpace, PixelDepth};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u16,
    pub height: u16,
}

impl Size {
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// What a head may do once the mode is set: how many layers it can show and
/// whether layers may be scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct UsageBounds {
    pub layers: u8,
    pub scaling: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ViewPort {
    pub input: Size,
    pub output: Size,
    pub possible_usage: UsageBounds,
    pub guaranteed_usage: UsageBounds,
}

/// Display stream compression target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DscConfig {
    pub target_bits_per_pixel_x16: u16,
}

/// Hardware timing descriptor produced by mode validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Timings {
    pub pixel_clock_khz: u32,
    pub h_visible: u16,
    pub h_total: u16,
    pub v_visible: u16,
    pub v_total: u16,
    pub v_blank_start: u16,
    pub viewport: ViewPort,
    pub pixel_depth: PixelDepth,
    pub yuv420_only: bool,
    pub vrr_capable: bool,
    pub fixed_rate_link: bool,
    pub dsc: Option<DscConfig>,
    /// Drives one output from two physical heads.
    pub merge: bool,
}

impl Timings {
    pub const fn required_hw_heads(&self) -> usize {
        if self.merge { 2 } else { 1 }
    }

    /// Link bandwidth this head consumes at its current pixel depth.
    pub fn link_bandwidth_kbps(&self, space: ColorSpace) -> u64 {
        let bits_x16 = match self.dsc {
            Some(dsc) => dsc.target_bits_per_pixel_x16 as u64,
            None if space == ColorSpace::YCbCr420 => {
                self.pixel_depth.bits_per_pixel() as u64 * 8
            }
            None => self.pixel_depth.bits_per_pixel() as u64 * 16,
        };
        self.pixel_clock_khz as u64 * bits_x16 / 16
    }
}

/// Hardware-neutral mode a client asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ModeRequest {
    pub pixel_clock_khz: u32,
    pub h_visible: u16,
    pub h_total: u16,
    pub v_visible: u16,
    pub v_total: u16,
    pub viewport_in: Option<Size>,
    pub viewport_out: Option<Size>,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ModeValidationOverrides: u32 {
        const NO_EXTENDED_CAPABILITY_CHECK = 1 << 0;
        const NO_LINK_BANDWIDTH_CHECK = 1 << 1;
        const REQUIRE_BOOT_CLOCKS = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ModeValidationParams {
    pub overrides: ModeValidationOverrides,
    pub stereo: bool,
}
