//! dglabd — relay and control-plane server for DG-Lab hardware apps.
//!
//! The core sits between an agent-facing layer (which embeds this crate
//! and calls the outbound API on [`AppState`]) and the vendor mobile apps
//! speaking the DG-Lab WebSocket dialect. Each logical device session
//! pairs one synthetic controller endpoint with one connected app; the
//! broker relays strength commands and pulse batches outward and strength,
//! limit, and feedback telemetry back.

pub mod api;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod playback;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod state;
pub mod ws;

pub use config::Config;
pub use error::BridgeError;
pub use playback::PlaybackStatus;
pub use protocol::{Channel, Event, StrengthMode};
pub use session::SessionSnapshot;
pub use state::AppState;
pub use ws::build_router;
