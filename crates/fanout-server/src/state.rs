use crate::negotiator::Negotiator;
use crate::relay::RelayCoordinator;
use fanout_protocol::IceServer;
use std::sync::Arc;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: String,
    pub stun_servers: Vec<String>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // A .env file is optional
        let _ = dotenvy::dotenv();

        let bind_address = match std::env::var("BIND_ADDRESS") {
            Ok(address) => address,
            Err(_) => {
                let host = std::env::var("BIND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
                let port = match std::env::var("PORT") {
                    Ok(port) => port
                        .parse::<u16>()
                        .map_err(|e| anyhow::anyhow!("invalid PORT {:?}: {}", port, e))?,
                    Err(_) => DEFAULT_PORT,
                };
                format!("{}:{}", host, port)
            }
        };

        let stun_servers = std::env::var("STUN_SERVERS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_else(|_| vec![DEFAULT_STUN_SERVER.to_string()]);

        Ok(Config {
            bind_address,
            stun_servers,
        })
    }

    /// ICE servers as handed to browsers
    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.stun_servers
            .iter()
            .map(|url| IceServer {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect()
    }
}

pub struct AppState<N: Negotiator> {
    pub config: Config,
    pub relay: Arc<RelayCoordinator<N>>,
}

impl<N: Negotiator> AppState<N> {
    pub fn new(config: Config, relay: Arc<RelayCoordinator<N>>) -> Self {
        Self { config, relay }
    }
}

// Not derived: N need not be Clone
impl<N: Negotiator> Clone for AppState<N> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            relay: Arc::clone(&self.relay),
        }
    }
}
