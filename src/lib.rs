//! A Linux filesystem event watcher built on fanotify
//!
//! This crate watches paths (or an entire mount) through the kernel's
//! fanotify notification group and delivers a stream of typed events,
//! including permission-decision events that block the originating
//! syscall until the consumer answers allow or deny.
//!
//! # Features
//!
//! - **Kernel negotiation**: init flags are chosen for the running kernel,
//!   so file names and identifiers are reported wherever the kernel can
//! - **Safe decoding**: the variable-length event stream is decoded field
//!   by field with every kernel-supplied length bounds-checked
//! - **Owned descriptors**: every delivered event carries an owned fd that
//!   closes with the event
//! - **Permission gating**: permission requests carry a responder; an
//!   unanswered request is denied when dropped
//!
//! Watching requires the `CAP_SYS_ADMIN` capability. Each watcher is
//! bound to a single mount point, established by the first added path;
//! watching several mounts takes several watchers.
//!
//! # Examples
//!
//! ## Watching a directory
//!
//! ```no_run
//! use fanotify_watcher::{PermissionMode, Watcher};
//!
//! fn main() -> fanotify_watcher::Result<()> {
//!     let watcher = Watcher::new(PermissionMode::None)?;
//!     watcher.add("/mnt/data")?;
//!
//!     for event in watcher.events() {
//!         println!("{event}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Gating file access
//!
//! ```no_run
//! use fanotify_watcher::{PermissionMode, Watcher};
//!
//! fn main() -> fanotify_watcher::Result<()> {
//!     let watcher = Watcher::new(PermissionMode::PreContent)?;
//!     watcher.add("/mnt/data")?;
//!
//!     for request in watcher.permission_events() {
//!         if request.path.ends_with("secrets.txt") {
//!             request.deny()?;
//!         } else {
//!             request.allow()?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod decoder;

pub mod error;
pub mod event;
pub mod flags;
pub mod kernel;
pub mod linux;
pub mod mount;
pub mod watcher;

pub use error::{Result, WatcherError};
pub use event::{Event, Op, PermissionEvent};
pub use flags::{EventMask, InitFlags, PermissionMode};
pub use kernel::{have_sys_admin, KernelVersion};
pub use mount::Mount;
pub use watcher::Watcher;
