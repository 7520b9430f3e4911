//! Expansion board attach.

use super::Device;
use sdr_core::{Capabilities, Result, SdrError, Xb};
use tracing::info;

impl Device {
    /// Attach `xb`. At most one expansion board per handle; a second
    /// attach fails without touching the first. It stays attached until
    /// the handle closes or the device is reset.
    pub fn expansion_attach(&self, xb: Xb) -> Result<()> {
        self.with_capability("expansion_attach", Capabilities::EXPANSION, |bound| {
            if bound.xb != Xb::None {
                return Err(SdrError::invalid_state(
                    "expansion_attach",
                    format!("{} is already attached", bound.xb),
                ));
            }
            bound.board.expansion_attach(xb)?;
            bound.xb = xb;
            info!(serial = %self.inner.info.serial, xb = %xb, "Expansion board attached");
            Ok(())
        })
    }

    /// The attached expansion board, [`Xb::None`] if there is none.
    pub fn expansion_get_attached(&self) -> Result<Xb> {
        self.with_capability(
            "expansion_get_attached",
            Capabilities::EXPANSION,
            |bound| Ok(bound.xb),
        )
    }
}
