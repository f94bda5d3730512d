//! Cache coherence protocol.
//!
//! Two tiers hold the same logical records:
//!
//! - **Memory**: the reactive [`QueryCache`], the only thing readers see
//! - **Durable**: a [`DurableStore`](crate::application::repos::DurableStore)
//!   mirror written through [`SyncedCache`], loaded back at startup by
//!   [`HydrationCoordinator`]
//!
//! Writes reach memory first and the durable tier second. Remote reads land
//! through [`QueryClient`], speculative writes through [`OptimisticEngine`],
//! and server-pushed changes through [`InvalidationHandler`].
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! default_stale_after_secs = 30
//! default_evict_after_secs = 300
//! max_hydration_age_secs = 86400
//!
//! [cache.kinds.employee]
//! session_level = true
//! stale_after_secs = 600
//! ```

mod accessor;
mod config;
mod consumer;
mod events;
mod fetch;
mod gate;
mod hydration;
pub(crate) mod lock;
mod optimistic;
mod planner;
mod store;
mod subscription;
mod synced;

pub use accessor::SyncAccessor;
pub use config::{CacheConfig, DEFAULT_DRAFTS_KIND, KindPolicy, KindSettings, SessionScope};
pub use consumer::{InvalidationHandler, InvalidationOutcome};
pub use events::{
    Epoch, InboundEvent, NotificationReceiver, NotificationSender, PublishError, channel,
};
pub use fetch::{FetchError, QueryClient};
pub use gate::{GateState, SessionGate};
pub use hydration::{HydrationCoordinator, HydrationReport};
pub use optimistic::{
    Mutation, MutationError, MutationOptions, MutationOutcome, OpPhase, OpStatus,
    OptimisticEngine, PendingOptimisticOp,
};
pub use planner::InvalidationPlan;
pub use store::{Edit, FetchTicket, QueryCache, Snapshot};
pub use subscription::{CacheChange, CallbackSubscription, Subscription};
pub use synced::SyncedCache;
