use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ColorSpace {
    #[default]
    Rgb,
    YCbCr444,
    YCbCr422,
    YCbCr420,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ColorRange {
    #[default]
    Full,
    Limited,
}

/// Bits per color component.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum ColorBpc {
    Six,
    #[default]
    Eight,
    Ten,
}

impl ColorBpc {
    pub const fn bits(self) -> u8 {
        match self {
            ColorBpc::Six => 6,
            ColorBpc::Eight => 8,
            ColorBpc::Ten => 10,
        }
    }
}

/// Pixel format on the wire between the head and the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelDepth {
    Bpp18Rgb444,
    #[default]
    Bpp24Rgb444,
    Bpp30Rgb444,
    Bpp16Ycbcr422,
    Bpp20Ycbcr422,
}

impl PixelDepth {
    pub fn for_color(space: ColorSpace, bpc: ColorBpc) -> Self {
        match (space, bpc) {
            (ColorSpace::YCbCr422, ColorBpc::Ten) => PixelDepth::Bpp20Ycbcr422,
            (ColorSpace::YCbCr422, _) => PixelDepth::Bpp16Ycbcr422,
            (_, ColorBpc::Six) => PixelDepth::Bpp18Rgb444,
            (_, ColorBpc::Eight) => PixelDepth::Bpp24Rgb444,
            (_, ColorBpc::Ten) => PixelDepth::Bpp30Rgb444,
        }
    }

    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            PixelDepth::Bpp18Rgb444 => 18,
            PixelDepth::Bpp24Rgb444 => 24,
            PixelDepth::Bpp30Rgb444 => 30,
            PixelDepth::Bpp16Ycbcr422 => 16,
            PixelDepth::Bpp20Ycbcr422 => 20,
        }
    }

    pub const fn bpc(self) -> ColorBpc {
        match self {
            PixelDepth::Bpp18Rgb444 => ColorBpc::Six,
            PixelDepth::Bpp24Rgb444 | PixelDepth::Bpp16Ycbcr422 => ColorBpc::Eight,
            PixelDepth::Bpp30Rgb444 | PixelDepth::Bpp20Ycbcr422 => ColorBpc::Ten,
        }
    }

    /// Next step down the ladder within the same sampling, `None` at the floor.
    /// Never returns a depth with more bits than `self`.
    pub const fn downgraded(self) -> Option<Self> {
        match self {
            PixelDepth::Bpp30Rgb444 => Some(PixelDepth::Bpp24Rgb444),
            PixelDepth::Bpp24Rgb444 => Some(PixelDepth::Bpp18Rgb444),
            PixelDepth::Bpp20Ycbcr422 => Some(PixelDepth::Bpp16Ycbcr422),
            PixelDepth::Bpp18Rgb444 | PixelDepth::Bpp16Ycbcr422 => None,
        }
    }
}

/// Color attributes a head ends up driving after resolution and any downgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResolvedColor {
    pub space: ColorSpace,
    pub range: ColorRange,
    pub pixel_depth: PixelDepth,
}

impl ResolvedColor {
    pub const fn bpc(&self) -> ColorBpc {
        self.pixel_depth.bpc()
    }
}

/// Axes the client fixed explicitly; the validator may not downgrade them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ColorPins {
    pub space: bool,
    pub range: bool,
    pub bpc: bool,
}

/// Last color attributes requested for an output, used when a request names none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ColorPreference {
    pub space: ColorSpace,
    pub range: ColorRange,
    pub bpc: ColorBpc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DitherState {
    #[default]
    Auto,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DitherMode {
    #[default]
    Dynamic2x2,
    Static2x2,
    Temporal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dithering {
    pub state: DitherState,
    pub mode: DitherMode,
}

impl Dithering {
    pub fn is_enabled_for(&self, depth: PixelDepth) -> bool {
        match self.state {
            DitherState::Auto => depth.bpc() < ColorBpc::Ten,
            DitherState::Enabled => true,
            DitherState::Disabled => false,
        }
    }
}
