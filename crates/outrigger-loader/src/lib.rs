//! # Outrigger Loader
//!
//! Parent side of the plugin boundary. The [`Loader`] discovers `*.plugin`
//! and `*.module` binaries, verifies them, launches each one as a child
//! process, captures its handshake, registers it over RPC and folds the
//! endpoints it advertises into a shared route map. The [`Broker`] lets
//! loaded plugins call each other through the loader.
//!
//! ## Example
//!
//! ```no_run
//! use outrigger_core::AppConfig;
//! use outrigger_loader::{Broker, Loader};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::from_file("outrigger.yaml")?;
//! let loader = Loader::from_config(&config)?;
//! Broker::new(loader.clone()).start().await?;
//! let loaded = loader.initialize(config.agent.secure_by_default).await?;
//! println!("loaded {loaded:?}");
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod control;
pub mod instance;
pub mod launch;
pub mod loader;

pub use broker::{Broker, BrokerServer};
pub use instance::{Instance, InstanceSummary};
pub use loader::{HandlerEntry, Loader, AGENT_OWNER};
