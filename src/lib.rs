//! Tidybook offline core
//!
//! Wires the storage, offline and networking crates into one app instance.
//! Start with [`bootstrap`]:
//!
//! ```no_run
//! use tidybook::{bootstrap, init_tracing, BootstrapConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! init_tracing("info");
//! let config = BootstrapConfig::load("tidybook.json").await?;
//! let app = bootstrap(config).await?;
//! app.offline.sync_data().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootstrap;
pub mod telemetry;

pub use bootstrap::{bootstrap, ApiSection, BootstrapConfig, Tidybook};
pub use telemetry::init_tracing;

pub use networking;
pub use offline;
pub use storage;
