use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::Context;
use panel_supervisor::StopPolicy;

const DEFAULT_FACTORIO_DIR: &str = "/usr/local/factorio";
const DEFAULT_HTTP_PORT: u16 = 8000;
const DEFAULT_GAME_PORT: u16 = 34197;
const DEFAULT_STOP_GRACE_SEC: u64 = 30;
const DEFAULT_STOP_FORWARD_MAX_SEC: u64 = 60;
const DEFAULT_COMMAND_TIMEOUT_SEC: u64 = 120;

#[derive(Debug, Clone)]
pub struct PanelConfig {
    pub factorio_dir: PathBuf,
    pub executable: PathBuf,
    pub admin_password: String,
    pub listen: SocketAddr,
    /// Declared port when a start request does not name one.
    pub default_game_port: u16,
    /// `None` disables SIGKILL escalation.
    pub stop_grace: Option<Duration>,
    pub stop_forward_max: Duration,
    pub command_timeout: Duration,
}

impl PanelConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |name: &str| get(name).filter(|v| !v.trim().is_empty());
        let u64_var = |name: &str| -> anyhow::Result<Option<u64>> {
            var(name)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .with_context(|| format!("{name} must be an unsigned integer, got {v:?}"))
                })
                .transpose()
        };
        let port_var = |name: &str, default: u16| -> anyhow::Result<u16> {
            match var(name) {
                Some(v) => v
                    .trim()
                    .parse::<u16>()
                    .with_context(|| format!("{name} must be a port number, got {v:?}")),
                None => Ok(default),
            }
        };

        let factorio_dir =
            PathBuf::from(var("FACTORIO_DIR").unwrap_or_else(|| DEFAULT_FACTORIO_DIR.to_string()));
        let executable = var("FACTORIO_EXE")
            .map(PathBuf::from)
            .unwrap_or_else(|| factorio_dir.join("bin").join("x64").join("factorio"));

        let bind: IpAddr = match var("PANEL_BIND") {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("PANEL_BIND must be an IP address, got {v:?}"))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let listen = SocketAddr::new(bind, port_var("PORT", DEFAULT_HTTP_PORT)?);

        let default_game_port = port_var("FACTORIO_DEFAULT_PORT", DEFAULT_GAME_PORT)?;
        if default_game_port == 0 {
            anyhow::bail!("FACTORIO_DEFAULT_PORT must be non-zero");
        }

        let stop_grace_sec = u64_var("PANEL_STOP_GRACE_SEC")?
            .map(|v| v.clamp(0, 600))
            .unwrap_or(DEFAULT_STOP_GRACE_SEC);
        let stop_forward_max_sec = u64_var("PANEL_STOP_FORWARD_MAX_SEC")?
            .map(|v| v.clamp(1, 3600))
            .unwrap_or(DEFAULT_STOP_FORWARD_MAX_SEC);
        let command_timeout_sec = u64_var("PANEL_COMMAND_TIMEOUT_SEC")?
            .map(|v| v.clamp(1, 3600))
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SEC);

        Ok(Self {
            factorio_dir,
            executable,
            admin_password: get("ADMIN_PASSWORD").unwrap_or_default(),
            listen,
            default_game_port,
            stop_grace: (stop_grace_sec > 0).then(|| Duration::from_secs(stop_grace_sec)),
            stop_forward_max: Duration::from_secs(stop_forward_max_sec),
            command_timeout: Duration::from_secs(command_timeout_sec),
        })
    }

    pub fn stop_policy(&self) -> StopPolicy {
        StopPolicy {
            grace: self.stop_grace,
            forward_max: Some(self.stop_forward_max),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<PanelConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PanelConfig::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn defaults_match_stock_install() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(
            cfg.executable,
            PathBuf::from("/usr/local/factorio/bin/x64/factorio")
        );
        assert_eq!(cfg.listen.port(), 8000);
        assert_eq!(cfg.default_game_port, 34197);
        assert_eq!(cfg.admin_password, "");
        assert_eq!(cfg.stop_grace, Some(Duration::from_secs(30)));
        assert_eq!(cfg.stop_forward_max, Duration::from_secs(60));
    }

    #[test]
    fn executable_follows_factorio_dir_unless_overridden() {
        let cfg = config_from(&[("FACTORIO_DIR", "/srv/factorio")]).unwrap();
        assert_eq!(cfg.executable, PathBuf::from("/srv/factorio/bin/x64/factorio"));

        let cfg = config_from(&[
            ("FACTORIO_DIR", "/srv/factorio"),
            ("FACTORIO_EXE", "/opt/bin/factorio"),
        ])
        .unwrap();
        assert_eq!(cfg.executable, PathBuf::from("/opt/bin/factorio"));
    }

    #[test]
    fn zero_grace_disables_escalation_and_values_are_clamped() {
        let cfg = config_from(&[
            ("PANEL_STOP_GRACE_SEC", "0"),
            ("PANEL_STOP_FORWARD_MAX_SEC", "999999"),
        ])
        .unwrap();
        assert_eq!(cfg.stop_grace, None);
        assert_eq!(cfg.stop_forward_max, Duration::from_secs(3600));
        assert_eq!(cfg.stop_policy().grace, None);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(config_from(&[("PORT", "http")]).is_err());
        assert!(config_from(&[("PANEL_STOP_GRACE_SEC", "-1")]).is_err());
        assert!(config_from(&[("FACTORIO_DEFAULT_PORT", "0")]).is_err());
        assert!(config_from(&[("PANEL_BIND", "localhost")]).is_err());
    }
}
