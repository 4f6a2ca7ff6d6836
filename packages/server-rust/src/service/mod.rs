//! Process lifecycle plumbing shared by every component.
//!
//! 1. **Lifecycle** (`registry`): ordered init/shutdown of long-lived components
//! 2. **Background workers** (`worker`): cancellable periodic tasks (discovery
//!    refresh, reconciliation sweeps)

pub mod registry;
pub mod worker;

pub use registry::{LifecycleContext, LifecycleRegistry, ManagedService};
pub use worker::{BackgroundRunnable, BackgroundWorker};
