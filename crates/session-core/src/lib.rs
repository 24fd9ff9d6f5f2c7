//! The session core: where SIP signaling and PS media meet.
//!
//! One [`session::GbSession`] exists per camera stream, owned by the
//! [`manager::GbManager`] registry and driven by its own periodic task. A
//! [`sip::SipTcpConn`] binds to the session by device id and walks the GB
//! dialog (REGISTER → INVITE → Stable → BYE); a [`media::MediaTcpConn`]
//! binds by SSRC and feeds decoded PS packs in. The session watches both
//! through shared handles and decides when the stream is Established, when
//! to re-INVITE after media loss, and when to dispose everything.
//!
//! Tasks cooperate through [`interrupt::Interrupt`] handles: disposal flags
//! the owning tasks, which unwind at their next suspension point and release
//! their registry references on the way out.

pub mod config;
pub mod error;
pub mod interrupt;
pub mod manager;
pub mod media;
pub mod session;
pub mod sip;

pub use config::CoreConfig;
pub use error::{Error, Result};
pub use interrupt::Interrupt;
pub use manager::{GbManager, ResourceManager};
pub use media::MediaTcpConn;
pub use session::{GbSession, SessionState};
pub use sip::{SipState, SipTcpConn};
