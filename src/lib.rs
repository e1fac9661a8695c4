/*!
 * Tether - resilience and coordination for service calls
 *
 * - Circuit breaking with retry, timeout and fallback policies
 * - Distributed locking with lease renewal and deadlock detection
 * - Service discovery with health probing and load balancing
 * - Resource accounting, per-module connection pools and a result cache
 *
 * The components live in the `tether-core-*` crates and are re-exported here.
 * `Tether` wires them together from a single `TetherConfig`.
 */

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

pub use config::{LogLevel, LoggingConfig, TetherConfig};
pub use error::{ErrorKind, Result, TetherError};
pub use runtime::{Tether, TetherBuilder, TetherStatus};

pub use tether_core_discovery as discovery;
pub use tether_core_locking as locking;
pub use tether_core_resilience as resilience;
pub use tether_core_resources as resources;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
