use std::sync::Arc;

use panel_supervisor::ManagedServerSlot;

use crate::auth::AdminCredentials;
use crate::config::PanelConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PanelConfig>,
    pub slot: ManagedServerSlot,
    pub admin: AdminCredentials,
}

impl AppState {
    pub fn new(config: PanelConfig) -> anyhow::Result<Self> {
        if config.admin_password.is_empty() {
            tracing::warn!("ADMIN_PASSWORD is empty; mutating requests accept an empty password");
        }
        let admin = AdminCredentials::new(&config.admin_password)?;
        let slot = ManagedServerSlot::new(config.stop_policy());
        Ok(Self {
            config: Arc::new(config),
            slot,
            admin,
        })
    }
}
