use async_trait::async_trait;
use chrono::NaiveTime;
use tokio::sync::RwLock;

use crate::model::*;

use super::error::PolicyRejection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsError(pub String);

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "settings unavailable: {}", self.0)
    }
}

impl std::error::Error for SettingsError {}

/// Read-only view of the configuration the policy gate consults per request.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn is_maintenance_mode(&self) -> Result<bool, SettingsError>;

    async fn maintenance_message(&self) -> Result<String, SettingsError> {
        Ok(DEFAULT_MAINTENANCE_MESSAGE.to_string())
    }

    /// `None` = no working-hours restriction.
    async fn working_hours(&self) -> Result<Option<WorkingHours>, SettingsError>;
}

/// Tenant settings as persisted through the WAL.
#[derive(Debug, Default)]
pub struct SettingsStore {
    inner: RwLock<Settings>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub async fn get(&self) -> Settings {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, settings: Settings) {
        *self.inner.write().await = settings;
    }
}

#[async_trait]
impl SettingsProvider for SettingsStore {
    async fn is_maintenance_mode(&self) -> Result<bool, SettingsError> {
        Ok(self.inner.read().await.maintenance_mode)
    }

    async fn maintenance_message(&self) -> Result<String, SettingsError> {
        Ok(self.inner.read().await.maintenance_message().to_string())
    }

    async fn working_hours(&self) -> Result<Option<WorkingHours>, SettingsError> {
        Ok(self.inner.read().await.working_hours)
    }
}

/// Evaluate maintenance mode and working hours once for a request.
///
/// Fails open: if the provider errors, that check is skipped and logged.
pub async fn check_policy(
    provider: &dyn SettingsProvider,
    role: Role,
    now: NaiveTime,
) -> Result<(), PolicyRejection> {
    match provider.is_maintenance_mode().await {
        Ok(true) => {
            let message = provider
                .maintenance_message()
                .await
                .unwrap_or_else(|_| DEFAULT_MAINTENANCE_MESSAGE.to_string());
            return Err(PolicyRejection::MaintenanceMode { message });
        }
        Ok(false) => {}
        Err(e) => tracing::warn!("maintenance check skipped: {e}"),
    }

    if role.is_admin() {
        return Ok(());
    }

    match provider.working_hours().await {
        Ok(Some(hours)) if !hours.within(now) => Err(PolicyRejection::OutsideWorkingHours {
            start: hours.start,
            end: hours.end,
            message: hours.message(),
        }),
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::warn!("working-hours check skipped: {e}");
            Ok(())
        }
    }
}
