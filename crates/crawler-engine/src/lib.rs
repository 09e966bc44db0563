//! Job orchestration for the knowledge crawler.
//!
//! Data flows scheduler/trigger → [`Admission`] → [`JobQueue`] →
//! [`Dispatcher`] worker → [`CrawlExecutor`] → [`CrawlCapability`], with every
//! lifecycle step published on the [`EventBus`] and folded into source
//! status by the [`StatusProjector`]. [`Orchestrator`] wires it together.

pub mod capability;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod projector;
pub mod queue;
pub mod scheduler;

pub use capability::{
    CancelSignal, CapabilitySet, CrawlCapability, CrawlContext, CrawlError, CrawlOutcome,
};
pub use dispatcher::{ActiveJobs, Dispatcher};
pub use error::{EngineError, Result};
pub use events::EventBus;
pub use executor::CrawlExecutor;
pub use orchestrator::{Orchestrator, Overview, RecoveryReport};
pub use projector::StatusProjector;
pub use queue::{Admission, JobQueue};
pub use scheduler::{SchedulerEngine, TickReport};
