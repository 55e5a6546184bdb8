//! Local service supervision and the self-updating launcher.
//!
//! [`supervisor::ServiceSupervisor`] runs one container per logical service
//! name, records it under the state directory and publishes its URL to the
//! shared registry. [`update::SelfUpdateController`] keeps the cached manager
//! payload and the wrapper script current.

pub mod cache;
pub mod fetch;
pub mod ports;
pub mod runtime;
pub mod supervisor;
pub mod update;

pub use cache::{FileCache, MemoryCache, PayloadCache};
pub use fetch::{Fetcher, HttpFetcher};
pub use ports::PortAllocator;
pub use runtime::{ContainerRuntime, DockerCli, LaunchSpec};
pub use supervisor::{ServiceSpec, ServiceSupervisor, StartedInstance, StopOutcome};
pub use update::{resolve, Action, CachePolicy, SelfUpdateController};
