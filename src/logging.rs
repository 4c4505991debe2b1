//=====================================================
// File: logging.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Tracing setup for processes embedding the engine
// Objective: Install one fmt subscriber honouring RUST_LOG, tagged with the
//            calling component
//=====================================================

use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

static INIT: OnceLock<()> = OnceLock::new();

/// Initialize tracing with a component label. Later calls only log.
///
/// Uses `try_init` so a subscriber installed by the embedding application
/// is left in place.
pub fn init(component: &str) {
    INIT.get_or_init(|| {
        let _ = SubscriberBuilder::default()
            .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact()
            .try_init();
    });
    tracing::debug!(component, "tracing initialised");
}

//=====================================================
// End of file
//=====================================================
