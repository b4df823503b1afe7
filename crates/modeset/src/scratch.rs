use crate::backend::{ScratchKind, ScratchPool};
use crate::error::ModesetError;

/// Holds one scratch buffer for the rest of the transaction and hands it
/// back on every exit path.
pub(crate) struct ScratchLease<'a, P: ScratchPool + ?Sized> {
    pool: &'a P,
    kind: ScratchKind,
}

impl<'a, P: ScratchPool + ?Sized> ScratchLease<'a, P> {
    pub(crate) fn acquire(pool: &'a P, kind: ScratchKind) -> Result<Self, ModesetError> {
        if !pool.acquire(kind) {
            return Err(ModesetError::ScratchUnavailable { kind });
        }
        Ok(Self { pool, kind })
    }
}

impl<P: ScratchPool + ?Sized> Drop for ScratchLease<'_, P> {
    fn drop(&mut self) {
        self.pool.release(self.kind);
    }
}
