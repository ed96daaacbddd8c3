//! Outbound dispatch pipeline: renderer → carrier → status update.

pub mod renderer;
pub mod sweep;
pub mod transport;

pub use renderer::{CoverSheetRenderer, DocumentRenderer, HttpRenderer, RenderedDocument};
pub use sweep::{DispatchLoop, FaxOutcome, SweepOutcome, SweepReport, spawn_sweep_ticker};
pub use transport::{
    FaxTransport, MockTransport, PhaxioTransport, SrfaxTransport, transport_from_config,
};
