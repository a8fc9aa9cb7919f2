//! Target descriptors
//!
//! A [`TargetDescriptor`] names the remote resource every tunnel session of
//! one relay process is bound to. It is built once, validated, and then
//! handed by value to each session that gets opened.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::DEFAULT_NETWORK_INTERFACE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("Missing required target field: {0}")]
    MissingField(&'static str),

    #[error("Invalid target port: {0}")]
    InvalidPort(u16),

    #[error("Invalid proxy address '{0}': expected [user:password@]host:port")]
    InvalidProxy(String),
}

/// Outbound HTTP proxy used to reach the tunnel endpoint
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxySettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }

    /// Parse `[user:password@]host:port`
    pub fn parse(value: &str) -> Result<Self, TargetError> {
        let invalid = || TargetError::InvalidProxy(value.to_string());

        let (credentials, address) = match value.rsplit_once('@') {
            Some((creds, addr)) => (Some(creds), addr),
            None => (None, value),
        };

        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;

        let mut settings = Self::new(host, port);
        if let Some(creds) = credentials {
            let (user, password) = creds.split_once(':').ok_or_else(invalid)?;
            settings = settings.with_credentials(user.to_string(), password.to_string());
        }

        Ok(settings)
    }

    /// `host:port` form suitable for dialing
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Remote resource a tunnel session connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub project: String,
    pub zone: String,
    pub instance: String,
    pub network_interface: String,
    pub port: u16,
    pub url_override: Option<String>,
    pub proxy: Option<ProxySettings>,
}

impl TargetDescriptor {
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        instance: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            instance: instance.into(),
            network_interface: DEFAULT_NETWORK_INTERFACE.to_string(),
            port,
            url_override: None,
            proxy: None,
        }
    }

    pub fn with_network_interface(mut self, interface: impl Into<String>) -> Self {
        self.network_interface = interface.into();
        self
    }

    pub fn with_url_override(mut self, url: impl Into<String>) -> Self {
        self.url_override = Some(url.into());
        self
    }

    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Check that the descriptor is complete enough to open sessions with
    pub fn validate(&self) -> Result<(), TargetError> {
        if self.project.trim().is_empty() {
            return Err(TargetError::MissingField("project"));
        }
        if self.zone.trim().is_empty() {
            return Err(TargetError::MissingField("zone"));
        }
        if self.instance.trim().is_empty() {
            return Err(TargetError::MissingField("instance"));
        }
        if self.network_interface.trim().is_empty() {
            return Err(TargetError::MissingField("network_interface"));
        }
        if self.port == 0 {
            return Err(TargetError::InvalidPort(self.port));
        }
        Ok(())
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{} ({})",
            self.project, self.zone, self.instance, self.port, self.network_interface
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_defaults() {
        let target = TargetDescriptor::new("my-project", "us-central1-a", "vm-1", 22);
        assert_eq!(target.network_interface, "nic0");
        assert!(target.url_override.is_none());
        assert!(target.proxy.is_none());
        assert!(target.validate().is_ok());
        assert_eq!(target.to_string(), "my-project/us-central1-a/vm-1:22 (nic0)");
    }

    #[test]
    fn test_target_validation() {
        let missing_zone = TargetDescriptor::new("p", "", "vm", 22);
        assert_eq!(
            missing_zone.validate(),
            Err(TargetError::MissingField("zone"))
        );

        let zero_port = TargetDescriptor::new("p", "z", "vm", 0);
        assert_eq!(zero_port.validate(), Err(TargetError::InvalidPort(0)));

        let blank_nic = TargetDescriptor::new("p", "z", "vm", 22).with_network_interface(" ");
        assert_eq!(
            blank_nic.validate(),
            Err(TargetError::MissingField("network_interface"))
        );
    }

    #[test]
    fn test_parse_proxy() {
        let proxy = ProxySettings::parse("proxy.internal:3128").unwrap();
        assert_eq!(proxy.host, "proxy.internal");
        assert_eq!(proxy.port, 3128);
        assert!(proxy.username.is_none());

        let proxy = ProxySettings::parse("alice:s3cr:et@10.0.0.1:8080").unwrap();
        assert_eq!(proxy.username.as_deref(), Some("alice"));
        assert_eq!(proxy.password.as_deref(), Some("s3cr:et"));
        assert_eq!(proxy.authority(), "10.0.0.1:8080");

        let proxy = ProxySettings::parse("[::1]:3128").unwrap();
        assert_eq!(proxy.host, "::1");
        assert_eq!(proxy.authority(), "[::1]:3128");
    }

    #[test]
    fn test_parse_proxy_rejects_garbage() {
        assert!(ProxySettings::parse("no-port").is_err());
        assert!(ProxySettings::parse(":3128").is_err());
        assert!(ProxySettings::parse("host:notaport").is_err());
        assert!(ProxySettings::parse("useronly@host:3128").is_err());
    }

    #[test]
    fn test_proxy_debug_redacts_password() {
        let proxy = ProxySettings::new("proxy", 3128)
            .with_credentials("alice".to_string(), "hunter2".to_string());
        let rendered = format!("{:?}", proxy);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_target_serialization() {
        let target = TargetDescriptor::new("p", "z", "vm", 5432)
            .with_url_override("tcp://127.0.0.1:5432")
            .with_proxy(ProxySettings::new("proxy", 3128));

        let json = serde_json::to_string(&target).unwrap();
        let parsed: TargetDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, target);
    }
}
