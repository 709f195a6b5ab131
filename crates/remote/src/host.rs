use std::net::IpAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::transport::TransportError;

/// One remote machine targeted by a fleet operation, identified by IP.
///
/// Fields mirror the hosts file; `port` stays a string because it is only
/// ever spliced into an `ip:port` dial address.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Host {
    pub ip: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
}

/// How to authenticate against a host. Key files are accepted in the hosts
/// file but the connector reports them as not implemented rather than
/// silently ignoring them.
#[derive(Debug, Clone)]
pub enum Credential {
    Password { user: String, password: String },
    KeyFile(PathBuf),
}

impl Host {
    /// Checks the identity fields the transport needs before any network
    /// I/O happens: user, password (or key), address and port non-empty,
    /// and the address must parse as an IP.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.username.is_empty() {
            return Err(TransportError::Validation(
                "host's user field is required".to_string(),
            ));
        }
        if self.password.is_empty() && self.ssh_key.is_none() {
            return Err(TransportError::Validation(
                "at least one of the host's password and ssh key is required".to_string(),
            ));
        }
        if self.ip.is_empty() {
            return Err(TransportError::Validation(
                "host address is required".to_string(),
            ));
        }
        if self.ip.parse::<IpAddr>().is_err() {
            return Err(TransportError::Validation(format!(
                "host address {} is not a valid IP address",
                self.ip
            )));
        }
        if self.port.is_empty() {
            return Err(TransportError::Validation(
                "host's port is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn credential(&self) -> Credential {
        if !self.password.is_empty() {
            Credential::Password {
                user: self.username.clone(),
                password: self.password.clone(),
            }
        } else {
            Credential::KeyFile(self.ssh_key.clone().unwrap_or_default())
        }
    }

    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Hosts with neither a username nor a password are deliberately left
    /// out of a run instead of being treated as misconfigured.
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(ip: &str, user: &str, password: &str, port: &str) -> Host {
        Host {
            ip: ip.to_string(),
            username: user.to_string(),
            password: password.to_string(),
            port: port.to_string(),
            ssh_key: None,
        }
    }

    #[test]
    fn validate_accepts_complete_host() {
        assert!(host("10.0.0.1", "root", "secret", "22").validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert!(host("10.0.0.1", "", "secret", "22").validate().is_err());
        assert!(host("10.0.0.1", "root", "", "22").validate().is_err());
        assert!(host("", "root", "secret", "22").validate().is_err());
        assert!(host("10.0.0.1", "root", "secret", "").validate().is_err());
    }

    #[test]
    fn validate_rejects_non_ip_address() {
        assert!(host("node-1.internal", "root", "secret", "22")
            .validate()
            .is_err());
    }

    #[test]
    fn key_file_credential_when_password_absent() {
        let mut h = host("10.0.0.1", "root", "", "22");
        h.ssh_key = Some(PathBuf::from("/root/.ssh/id_ed25519"));
        assert!(h.validate().is_ok());
        assert!(matches!(h.credential(), Credential::KeyFile(_)));
    }

    #[test]
    fn credential_prefers_password() {
        let h = host("10.0.0.1", "root", "secret", "22");
        assert!(matches!(h.credential(), Credential::Password { .. }));
    }
}
