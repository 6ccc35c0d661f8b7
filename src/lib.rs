//! # scrape-sentinel
//!
//! Coordination core for scraping many third-party sites through shared
//! browser sessions without getting them burned.
//!
//! Every action against a target goes through the [`ResourceCoordinator`],
//! which serializes access per target and wraps it in the usual defenses.
//!
//! ## Features
//!
//! - Per-target token buckets in four rate tiers
//! - Randomized human-like pacing between requests
//! - Quarantine with exponential backoff after CAPTCHA or block detection
//! - Staged escalation to an alternate engine and then a fresh identity
//! - Sticky, health-tracked proxy partitions persisted across restarts
//! - Prioritized job queue with a TTL result cache
//!
//! ## Example
//!
//! ```no_run
//! use scrape_sentinel::ResourceCoordinator;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let coordinator = ResourceCoordinator::new()?;
//!     let page = coordinator
//!         .execute("www.example.com", |session| {
//!             Box::pin(async move {
//!                 session.navigate("https://www.example.com/").await?;
//!                 session.content().await
//!             })
//!         })
//!         .await?;
//!     println!("{page}");
//!     Ok(())
//! }
//! ```

mod coordinator;

pub mod config;
pub mod detection;
pub mod modules;
pub mod scheduler;
pub mod session;

pub use crate::coordinator::{
    CoordinatorBuilder,
    CoordinatorError,
    CoordinatorResult,
    CoordinatorTelemetry,
    ErrorKind,
    ResourceCoordinator,
};

pub use crate::config::{
    ConfigError,
    CoordinatorConfig,
    CoordinatorConfigBuilder,
    TargetConfig,
};

pub use crate::detection::{
    Detection,
    DetectionKind,
    detect_page,
    detect_text,
    detect_url,
};

pub use crate::scheduler::{
    JobCallback,
    JobExecutor,
    JobFailure,
    JobFailureKind,
    JobId,
    JobPriority,
    JobResult,
    JobScheduler,
    JobStatus,
    ResultCache,
    SchedulerConfig,
    SchedulerStats,
    SearchPageExecutor,
    Submission,
};

pub use crate::session::{
    ActionOutcome,
    BrowserFamily,
    BrowserSession,
    DefaultSessionFactory,
    ExecutionMode,
    HttpSession,
    IdentityGenerator,
    LoadedPage,
    ScriptedSession,
    SessionConfig,
    SessionError,
    SessionFactory,
    SessionFuture,
    SessionIdentity,
    SessionRequest,
    SessionVariant,
    run_session_action,
};

pub use crate::modules::{
    Clock,
    DomainQuarantine,
    EscalationConfig,
    EscalationManager,
    EscalationTier,
    EventDispatcher,
    EventHandler,
    CoordinatorEvent,
    FailureKind,
    JsonFileProxyRepository,
    LoggingHandler,
    ManualClock,
    MemoryProxyRepository,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    PacingConfig,
    PoolAllocation,
    Proxy,
    ProxyGeo,
    ProxyHealthReport,
    ProxyPool,
    ProxyPoolConfig,
    ProxyRepository,
    QuarantineConfig,
    QuarantineEntry,
    QuarantineStats,
    RateLimitConfig,
    RateLimiter,
    RateTier,
    RedbProxyRepository,
    RepositoryError,
    SharedClock,
    SystemClock,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
