use crate::shadow::ShadowMirror;
use crate::sfu::{SessionCoordinator, WorkerPool, WorkerPoolConfig};
use crate::ws::connections::ConnectionManager;
use anyhow::Context;
use confab_media::{ListenIp, WebRtcTransportSettings, WorkerSettings};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Shadow state goes to Redis when set, to memory otherwise
    pub redis_url: Option<String>,
    pub media: MediaConfig,
}

/// Worker pool and transport settings
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub num_workers: usize,
    pub worker_restart_delay: Duration,
    pub engine_call_timeout: Duration,
    /// `None` keeps idle routers forever
    pub router_idle_timeout: Option<Duration>,
    pub listen_ip: String,
    pub public_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub initial_outgoing_bitrate: u32,
    pub min_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
    pub max_sctp_message_size: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        let pool = WorkerPoolConfig::default();
        let transport = WebRtcTransportSettings::default();
        Self {
            num_workers: pool.num_workers,
            worker_restart_delay: pool.restart_delay,
            engine_call_timeout: pool.call_timeout,
            router_idle_timeout: Some(Duration::from_secs(60)),
            listen_ip: "0.0.0.0".to_string(),
            public_ip: None,
            rtc_min_port: pool.settings.rtc_min_port,
            rtc_max_port: pool.settings.rtc_max_port,
            initial_outgoing_bitrate: transport.initial_available_outgoing_bitrate,
            min_outgoing_bitrate: transport.min_outgoing_bitrate,
            max_incoming_bitrate: transport.max_incoming_bitrate,
            max_sctp_message_size: transport.max_sctp_message_size,
        }
    }
}

impl MediaConfig {
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            num_workers: self.num_workers,
            restart_delay: self.worker_restart_delay,
            call_timeout: self.engine_call_timeout,
            settings: WorkerSettings {
                rtc_min_port: self.rtc_min_port,
                rtc_max_port: self.rtc_max_port,
                ..WorkerSettings::default()
            },
        }
    }

    pub fn transport_settings(&self) -> WebRtcTransportSettings {
        WebRtcTransportSettings {
            listen_ips: vec![ListenIp {
                ip: self.listen_ip.clone(),
                announced_ip: self.public_ip.clone(),
            }],
            max_sctp_message_size: self.max_sctp_message_size,
            initial_available_outgoing_bitrate: self.initial_outgoing_bitrate,
            min_outgoing_bitrate: self.min_outgoing_bitrate,
            max_incoming_bitrate: self.max_incoming_bitrate,
            ..WebRtcTransportSettings::default()
        }
    }
}

impl Config {
    /// Read the configuration from the process environment
    pub fn load() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`, which maps a variable name to its value
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = MediaConfig::default();

        let bind_address = lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:3000".to_string());
        let redis_url = lookup("REDIS_URL").filter(|url| !url.is_empty());
        if redis_url.is_none() {
            tracing::warn!("REDIS_URL not set, keeping shadow state in memory");
        }

        let idle_secs: u64 = parse(&lookup, "SFU_ROUTER_IDLE_TIMEOUT_SECS", 60)?;
        let media = MediaConfig {
            num_workers: parse(&lookup, "SFU_NUM_WORKERS", defaults.num_workers)?,
            worker_restart_delay: Duration::from_millis(parse(
                &lookup,
                "SFU_WORKER_RESTART_DELAY_MS",
                2000,
            )?),
            engine_call_timeout: Duration::from_millis(parse(
                &lookup,
                "SFU_ENGINE_CALL_TIMEOUT_MS",
                10_000,
            )?),
            router_idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            listen_ip: lookup("SFU_LISTEN_IP").unwrap_or(defaults.listen_ip),
            public_ip: lookup("SFU_PUBLIC_IP").filter(|ip| !ip.is_empty()),
            rtc_min_port: parse(&lookup, "SFU_RTC_MIN_PORT", defaults.rtc_min_port)?,
            rtc_max_port: parse(&lookup, "SFU_RTC_MAX_PORT", defaults.rtc_max_port)?,
            initial_outgoing_bitrate: parse(
                &lookup,
                "SFU_INITIAL_OUTGOING_BITRATE",
                defaults.initial_outgoing_bitrate,
            )?,
            min_outgoing_bitrate: parse(&lookup, "SFU_MIN_OUTGOING_BITRATE", defaults.min_outgoing_bitrate)?,
            max_incoming_bitrate: parse(&lookup, "SFU_MAX_INCOMING_BITRATE", defaults.max_incoming_bitrate)?,
            max_sctp_message_size: parse(
                &lookup,
                "SFU_MAX_SCTP_MESSAGE_SIZE",
                defaults.max_sctp_message_size,
            )?,
        };

        if media.num_workers == 0 {
            anyhow::bail!("SFU_NUM_WORKERS must be at least 1");
        }
        if media.rtc_min_port > media.rtc_max_port {
            anyhow::bail!(
                "SFU_RTC_MIN_PORT ({}) is above SFU_RTC_MAX_PORT ({})",
                media.rtc_min_port,
                media.rtc_max_port
            );
        }

        Ok(Config {
            bind_address,
            redis_url,
            media,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value {raw:?} for {key}")),
        None => Ok(default),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub connections: Arc<ConnectionManager>,
    pub coordinator: Arc<SessionCoordinator>,
}

impl AppState {
    pub fn new(media: &MediaConfig, pool: Arc<WorkerPool>, shadow: ShadowMirror) -> Self {
        let connections = Arc::new(ConnectionManager::new());
        let coordinator = SessionCoordinator::new(
            pool,
            shadow,
            media.transport_settings(),
            media.router_idle_timeout,
            connections.clone(),
        );

        Self {
            connections,
            coordinator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert!(config.redis_url.is_none());
        assert_eq!(config.media.router_idle_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.media.engine_call_timeout, Duration::from_secs(10));
        assert_eq!(config.media.pool_config().settings.rtc_min_port, 40000);
        assert!(config.media.num_workers >= 1);
    }

    #[test]
    fn zero_idle_timeout_disables_eviction() {
        let config = config_from(&[("SFU_ROUTER_IDLE_TIMEOUT_SECS", "0")]).unwrap();
        assert_eq!(config.media.router_idle_timeout, None);
    }

    #[test]
    fn public_ip_is_announced() {
        let config = config_from(&[("SFU_LISTEN_IP", "10.0.0.5"), ("SFU_PUBLIC_IP", "203.0.113.7")]).unwrap();
        let settings = config.media.transport_settings();
        assert_eq!(settings.listen_ips[0].ip, "10.0.0.5");
        assert_eq!(settings.listen_ips[0].announced_ip.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = config_from(&[("SFU_NUM_WORKERS", "many")]).unwrap_err();
        assert!(err.to_string().contains("SFU_NUM_WORKERS"));

        let err = config_from(&[("SFU_RTC_MIN_PORT", "50000"), ("SFU_RTC_MAX_PORT", "40000")]).unwrap_err();
        assert!(err.to_string().contains("SFU_RTC_MIN_PORT"));
    }
}
