//! entry point called by main to run the rehearsal server core
//!
//! Builds the room manager and session binder from settings.json and
//! wires the reaper.  The concrete transports and the HTTP lobby are
//! assembled outside: they get their delivery points from
//! [`Engine::callbacks`] and their lobby operations from
//! [`Engine::room_manager`].
use log::info;
use std::sync::Arc;
use std::time::Duration;

use crate::common::box_error::BoxError;
use crate::common::config::Config;
use crate::common::transport::TransportCallbacks;
use crate::server::room::RoomTimeouts;
use crate::server::room_manager::{ManagerSettings, RoomManager};
use crate::server::session_binder::SessionBinder;

pub struct Engine {
    manager: Arc<RoomManager>,
    binder: Arc<SessionBinder>,
}

impl Engine {
    /// Build from settings.json in the working directory (created with
    /// defaults if absent).
    pub fn build() -> Result<Engine, BoxError> {
        let mut config = Config::build();
        config.load_from_file()?;
        let settings = ManagerSettings {
            max_participants: config.get_u32_value("max_participants", 4) as usize,
            ring_capacity: config.get_u32_value("ring_capacity", 64) as usize,
            timeouts: RoomTimeouts {
                unbound: Duration::from_secs(
                    config.get_u32_value("unbound_timeout_secs", 30) as u64
                ),
                inactivity: Duration::from_secs(
                    config.get_u32_value("inactivity_timeout_secs", 60) as u64,
                ),
            },
            vacate_cooldown: Duration::from_secs(
                config.get_u32_value("vacate_cooldown_hours", 24) as u64 * 3600,
            ),
            reaper_sweep_interval: Duration::from_secs(5),
        };
        Self::build_with(settings)
    }

    /// Build with explicit settings (tests, embedders).
    pub fn build_with(settings: ManagerSettings) -> Result<Engine, BoxError> {
        let manager = Arc::new(RoomManager::new(settings));
        manager.initialize_default_rooms();
        let binder = Arc::new(SessionBinder::new(
            Arc::clone(&manager),
            settings.timeouts.unbound,
        ));
        let sweep_binder = Arc::clone(&binder);
        manager.start_reaper(Some(Box::new(move || sweep_binder.reap_stale_pending())));
        info!("engine up: {} rooms", manager.list_rooms().len());
        Ok(Engine { manager, binder })
    }

    /// Delivery points for any transport stack.
    pub fn callbacks(&self) -> Arc<dyn TransportCallbacks> {
        Arc::clone(&self.binder) as Arc<dyn TransportCallbacks>
    }

    pub fn room_manager(&self) -> Arc<RoomManager> {
        Arc::clone(&self.manager)
    }

    pub fn binder(&self) -> Arc<SessionBinder> {
        Arc::clone(&self.binder)
    }

    /// Reaper first, then every room's RT thread.
    pub fn shutdown(&self) -> () {
        self.manager.shutdown();
        info!("engine down");
    }
}

#[cfg(test)]
mod test_engine {
    use super::*;

    #[test]
    fn builds_rooms_and_shuts_down() {
        let engine = Engine::build_with(ManagerSettings::default()).unwrap();
        assert_eq!(engine.room_manager().list_rooms().len(), 16);
        let _callbacks = engine.callbacks();
        engine.shutdown();
    }
}
