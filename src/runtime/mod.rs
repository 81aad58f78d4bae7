//! Session runtime: runs the session controller in its own task
//!
//! ```text
//! Console ──[SessionCommand]──► SessionWorker ◄──[SessionEvent]── transport pump
//!    ▲                               │
//!    └──────[SessionSnapshot]────────┘ (watch)
//! ```
//!
//! The worker is the only owner of the [`SessionController`]; commands and
//! transport events are handled one at a time, in arrival order.
//!
//! [`SessionController`]: crate::mqtt::session::SessionController

pub mod session_handle;
pub mod session_worker;

pub use session_handle::SessionHandle;
pub use session_worker::SessionCommand;
