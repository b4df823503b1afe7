use crate::backend::ScratchKind;

/// Failures outside the transaction status taxonomy. Whenever one of these
/// is returned before a commit reached the hardware, nothing changed.
#[derive(Debug, thiserror::Error)]
pub enum ModesetError {
    #[error("scratch buffer {kind:?} unavailable")]
    ScratchUnavailable { kind: ScratchKind },
    #[error("satellite channels of disp {disp} still busy after {budget} polls")]
    ChannelsNotIdle { disp: usize, budget: u32 },
    #[error("device wedged: hardware update on disp {disp} never completed")]
    DeviceWedged { disp: usize },
}
