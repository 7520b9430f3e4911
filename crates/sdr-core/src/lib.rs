//! Core types, capability tables and stream engine for the `sdrhal` device
//! layer.
//!
//! The device handle composes two independent capability tables:
//!
//! - [`TransportBackend`]: raw device I/O (control requests, registers,
//!   bulk transfers, image writes);
//! - [`BoardDriver`]: hardware-revision semantics layered on a backend.
//!
//! Both are traits with one implementation per variant. Entries a variant
//! lacks report [`SdrError::Unsupported`] instead of being absent.
//!
//! The crate also provides the pieces every board driver shares: the
//! [`stream`] engine (async buffer exchange and blocking sync calls), the
//! [`retune`] queue ordering, and the [`trigger`] register protocol.

pub mod board;
pub mod devinfo;
pub mod error;
pub mod metadata;
pub mod retune;
pub mod stream;
pub mod transport;
pub mod trigger;
pub mod types;

pub use board::{BoardDriver, BoardFactory};
pub use devinfo::{BackendKind, DevInfo};
pub use error::{ErrorKind, Result, SdrError};
pub use metadata::{MetaFlags, MetaStatus, Metadata};
pub use retune::{
    LmsQuickTune, QuickTune, RetuneEntry, RetuneQueue, RficQuickTune, RETUNE_NOW,
    RETUNE_QUEUE_DEPTH,
};
pub use stream::{
    BufferStatus, Stream, StreamAction, StreamCallback, StreamConfig, StreamEvent, StreamPhase,
    StreamStats, SyncStream,
};
pub use transport::{
    BackendFactory, Completion, CompletionFn, ControlRequest, RegisterSpace, Transfer,
    TransferStatus, TransportBackend,
};
pub use trigger::{Trigger, TriggerPhase, TriggerRole, TriggerSignal, TriggerState};
pub use types::{
    Capabilities, Channel, ChannelLayout, Correction, DevSpeed, Direction, FpgaSize, GainMode,
    RationalRate, RxMux, SampleFormat, Sampling, SmbMode, TuningMode, Version, Xb,
};

pub use sdr_pool::{BufferPool, PooledBuffer};
