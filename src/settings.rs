use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[allow(unused)]
pub struct Controllers {
    pub join_token_request: bool,
    pub control_plane: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(unused)]
pub struct Settings {
    /// Address of the metrics and diagnostics server
    pub listen: String,
    /// Field manager used for server-side apply
    pub field_manager: String,
    /// Delay before a failed reconciliation is retried
    pub retry_interval_secs: u64,
    /// Interval between control plane status refreshes
    pub status_resync_secs: u64,
    /// Deadline for reaching a workload cluster API
    pub probe_timeout_secs: u64,
    pub controllers: Controllers,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            field_manager: "k0smotron".into(),
            retry_interval_secs: 60,
            status_resync_secs: 30,
            probe_timeout_secs: 10,
            controllers: Controllers {
                join_token_request: true,
                control_plane: true,
            },
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let settings = Config::builder()
            .set_default("listen", defaults.listen)?
            .set_default("field_manager", defaults.field_manager)?
            .set_default("retry_interval_secs", defaults.retry_interval_secs)?
            .set_default("status_resync_secs", defaults.status_resync_secs)?
            .set_default("probe_timeout_secs", defaults.probe_timeout_secs)?
            .set_default(
                "controllers.join_token_request",
                defaults.controllers.join_token_request,
            )?
            .set_default("controllers.control_plane", defaults.controllers.control_plane)?
            .add_source(File::with_name("settings").required(false))
            .add_source(File::with_name("/etc/k0smotron/settings").required(false))
            .add_source(
                Environment::with_prefix("K0SMOTRON")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn status_resync(&self) -> Duration {
        Duration::from_secs(self.status_resync_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}
