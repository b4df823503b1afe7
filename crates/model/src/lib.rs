//! Device vocabulary shared by the modeset engine and its request protocol.

pub mod color;
pub mod connector;
pub mod flip;
pub mod ids;
pub mod timings;

pub use color::{
    ColorBpc, ColorPins, ColorPreference, ColorRange, ColorSpace, DitherMode, DitherState,
    Dithering, PixelDepth, ResolvedColor,
};
pub use connector::{Connector, ConnectorKey, Dpy, LinkCaps, SignalFormat};
pub use flip::{
    FlipError, FlipState, HdrStaticMetadata, InputLut, LayerFlip, LutState, MAX_LAYERS_PER_HEAD,
    SurfaceDesc, SurfaceFormat, TransferFunction,
};
pub use ids::{
    DisplayId, DpyId, DpyIdList, GenerationId, HeadMask, Id, MAX_DPYS_PER_DISP,
    MAX_HEADS_PER_DISP, SlotId,
};
pub use timings::{
    DscConfig, ModeRequest, ModeValidationOverrides, ModeValidationParams, Size, Timings,
    UsageBounds, ViewPort,
};
