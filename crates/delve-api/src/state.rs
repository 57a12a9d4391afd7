use std::sync::Arc;

use delve_core::SessionManager;
use serde::Serialize;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    manager: SessionManager,
    auth_token: Option<Arc<String>>,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(manager: SessionManager, config: &AppConfig) -> Self {
        Self {
            manager,
            auth_token: config
                .auth_token
                .as_ref()
                .map(|token| Arc::new(token.to_string())),
            max_upload_bytes: config.max_upload_bytes,
        }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn auth_token(&self) -> Option<Arc<String>> {
        self.auth_token.clone()
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    pub fn capacity(&self) -> CapacitySnapshot {
        let scheduler = self.manager.scheduler();
        CapacitySnapshot {
            workers: scheduler.workers(),
            busy_workers: scheduler.in_flight(),
            free_queue_slots: scheduler.capacity(),
            accepting: !scheduler.is_closed(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CapacitySnapshot {
    pub workers: usize,
    pub busy_workers: usize,
    pub free_queue_slots: usize,
    pub accepting: bool,
}
