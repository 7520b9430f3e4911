//! Board drivers for the simulated product line.

mod common;
pub mod rev1;
pub mod rev2;

pub use rev1::{Rev1Board, Rev1Factory};
pub use rev2::{Rev2Board, Rev2Factory};

use sdr_core::BoardFactory;
use std::sync::Arc;

/// Every board factory in this crate, in match order.
pub fn board_factories() -> Vec<Arc<dyn BoardFactory>> {
    vec![Arc::new(Rev1Factory), Arc::new(Rev2Factory)]
}
