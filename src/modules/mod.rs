//! Coordination building blocks
//!
//! Time, rate budgets, quarantine, escalation, proxy health and per-target
//! state, plus the event and metrics plumbing the coordinator reports through.

pub mod clock;
pub mod escalation;
pub mod events;
pub mod metrics;
pub mod pacing;
pub mod proxy;
pub mod quarantine;
pub mod rate_limit;
pub mod state;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use escalation::{EscalationConfig, EscalationManager, EscalationSnapshot, EscalationTier};
pub use events::{
    ActionEvent, CoordinatorEvent, DetectionEvent, EventDispatcher, EventHandler, JobEvent,
    LoggingHandler, MetricsHandler, OutcomeEvent, RefusalEvent, RefusalReason, TierChangeEvent,
};
pub use metrics::{GlobalStats, MetricsCollector, MetricsSnapshot, TargetStats};
pub use pacing::{PacingConfig, PacingPolicy};
pub use proxy::{
    FailureKind, GroupHealth, JsonFileProxyRepository, MemoryProxyRepository, PoolAllocation,
    Proxy, ProxyDocument, ProxyGeo, ProxyHealthReport, ProxyPool, ProxyPoolConfig,
    ProxyRepository, RedbProxyRepository, RepositoryError,
};
pub use quarantine::{DomainQuarantine, QuarantineConfig, QuarantineEntry, QuarantineStats};
pub use rate_limit::{RateLimitConfig, RateLimiter, RateTier, TierLimits};
pub use state::{SessionSlot, TargetRegistry, TargetSnapshot, TargetState};
