//! smartpos-core: local-first point-of-sale core.
//!
//! An embedded SQLite store holds the full catalog and sales history so the
//! register keeps working offline; a manually triggered sync engine
//! reconciles it with a remote replica over versioned rows. The two load-
//! bearing pieces are the transactional order processor ([`orders::checkout`])
//! and the push/pull engine ([`sync`]); everything else feeds them.
//!
//! Monetary amounts are integer minor units throughout ([`money::Money`]);
//! binary floating point never touches a price.

pub mod db;
pub mod error;
pub mod inventory;
pub mod money;
pub mod orders;
pub mod recipes;
pub mod remote;
pub mod schema;
pub mod store;
pub mod sync;
pub mod versioning;

#[cfg(test)]
mod testutil;

pub use db::DbState;
pub use error::{PosError, Result};
pub use money::{Money, TaxRate};
pub use sync::{SyncState, SyncSummary};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging for embedding binaries. Honors
/// `RUST_LOG`; defaults to info with debug for this crate.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,smartpos_core=debug"));

    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .init();
}
