//! CLI and environment configuration surface. The binary needs somewhere to get bind
//! address, broker address, logging, and TLS settings from; parsed by hand, the same
//! way the rest of this crate parses the HTTP request line.

use std::env;

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_host: String,
    pub bind_port: u16,
    pub broker_host: String,
    pub broker_port: u16,
    pub log_path: Option<String>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_chain: String,
    pub private_key: String,
    pub dh_params: Option<String>,
    pub ciphers: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 9999,
            broker_host: "127.0.0.1".to_string(),
            broker_port: 6379,
            log_path: None,
            tls: None,
        }
    }
}

impl Config {
    pub fn broker_url(&self) -> String {
        format!("redis://{}:{}", self.broker_host, self.broker_port)
    }

    /// Apply the handful of values ops commonly overrides via the environment
    /// (`BIND_HOST`, `BIND_PORT`, `BROKER_HOST`, `BROKER_PORT`, `LOG_PATH`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = env::var("BIND_HOST") {
            config.bind_host = v;
        }
        if let Ok(v) = env::var("BIND_PORT") {
            if let Ok(port) = v.parse() {
                config.bind_port = port;
            }
        }
        if let Ok(v) = env::var("BROKER_HOST") {
            config.broker_host = v;
        }
        if let Ok(v) = env::var("BROKER_PORT") {
            if let Ok(port) = v.parse() {
                config.broker_port = port;
            }
        }
        if let Ok(v) = env::var("LOG_PATH") {
            config.log_path = Some(v);
        }
        config
    }

    /// Parse `--flag value` style arguments over an env-seeded default.
    pub fn from_args<I: Iterator<Item = String>>(args: I) -> Result<Self, String> {
        let mut config = Self::from_env();
        let mut args = args.peekable();
        args.next(); // argv[0]
        while let Some(flag) = args.next() {
            match flag.as_str() {
                "--bind-host" => config.bind_host = Self::take_value(&mut args, &flag)?,
                "--bind-port" => {
                    config.bind_port = Self::take_value(&mut args, &flag)?
                        .parse()
                        .map_err(|_| format!("{flag}: expected a port number"))?
                }
                "--broker-host" => config.broker_host = Self::take_value(&mut args, &flag)?,
                "--broker-port" => {
                    config.broker_port = Self::take_value(&mut args, &flag)?
                        .parse()
                        .map_err(|_| format!("{flag}: expected a port number"))?
                }
                "--log-path" => config.log_path = Some(Self::take_value(&mut args, &flag)?),
                "--tls-cert" => {
                    let cert_chain = Self::take_value(&mut args, &flag)?;
                    config.tls.get_or_insert_with(|| TlsConfig {
                        cert_chain: String::new(),
                        private_key: String::new(),
                        dh_params: None,
                        ciphers: None,
                    }).cert_chain = cert_chain;
                }
                "--tls-key" => {
                    let private_key = Self::take_value(&mut args, &flag)?;
                    config.tls.get_or_insert_with(|| TlsConfig {
                        cert_chain: String::new(),
                        private_key: String::new(),
                        dh_params: None,
                        ciphers: None,
                    }).private_key = private_key;
                }
                "--tls-dhparams" => {
                    let dh_params = Self::take_value(&mut args, &flag)?;
                    if let Some(tls) = config.tls.as_mut() {
                        tls.dh_params = Some(dh_params);
                    }
                }
                "--tls-ciphers" => {
                    let ciphers = Self::take_value(&mut args, &flag)?;
                    if let Some(tls) = config.tls.as_mut() {
                        tls.ciphers = Some(ciphers);
                    }
                }
                other => return Err(format!("unrecognized argument: {other}")),
            }
        }
        Ok(config)
    }

    fn take_value<I: Iterator<Item = String>>(
        args: &mut std::iter::Peekable<I>,
        flag: &str,
    ) -> Result<String, String> {
        args.next().ok_or_else(|| format!("{flag}: missing value"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.bind_port, 9999);
        assert_eq!(config.broker_port, 6379);
    }

    #[test]
    fn parses_bind_and_broker_flags() {
        let args = vec![
            "wsrelay".to_string(),
            "--bind-host".to_string(),
            "127.0.0.1".to_string(),
            "--bind-port".to_string(),
            "8080".to_string(),
            "--broker-port".to_string(),
            "6380".to_string(),
        ];
        let config = Config::from_args(args.into_iter()).unwrap();
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.bind_port, 8080);
        assert_eq!(config.broker_port, 6380);
    }

    #[test]
    fn rejects_unknown_flags() {
        let args = vec!["wsrelay".to_string(), "--nonsense".to_string()];
        assert!(Config::from_args(args.into_iter()).is_err());
    }

    #[test]
    fn broker_url_is_a_redis_url() {
        let config = Config::default();
        assert_eq!(config.broker_url(), "redis://127.0.0.1:6379");
    }
}
