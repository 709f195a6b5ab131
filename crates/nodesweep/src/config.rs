use std::collections::HashSet;

use remote::Host;
use serde::Deserialize;

/// The hosts file: the fleet a batch run targets.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct HostConfig {
    #[serde(default)]
    pub(crate) hosts: Vec<Host>,
}

pub(crate) fn parse_hosts(raw: &str) -> Result<HostConfig, serde_yaml::Error> {
    serde_yaml::from_str(raw)
}

/// IPs must be unique within a run; the first duplicate found invalidates
/// the whole configuration.
pub(crate) fn find_duplicate_ip(hosts: &[Host]) -> Option<String> {
    let mut seen = HashSet::new();
    for host in hosts {
        if !seen.insert(host.ip.as_str()) {
            return Some(host.ip.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hosts_file() {
        let raw = r#"
hosts:
  - ip: 10.0.0.1
    username: root
    password: secret
    port: "22"
  - ip: 10.0.0.2
    username: ops
    password: secret
    port: "2222"
"#;
        let config = parse_hosts(raw).unwrap();
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[1].port, "2222");
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let raw = r#"
hosts:
  - ip: 10.0.0.1
"#;
        let config = parse_hosts(raw).unwrap();
        assert!(config.hosts[0].username.is_empty());
        assert!(!config.hosts[0].has_credentials());
    }

    #[test]
    fn detects_duplicate_ips() {
        let raw = r#"
hosts:
  - ip: 10.0.0.1
  - ip: 10.0.0.2
  - ip: 10.0.0.1
"#;
        let config = parse_hosts(raw).unwrap();
        assert_eq!(find_duplicate_ip(&config.hosts).as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn unique_ips_are_accepted() {
        let raw = r#"
hosts:
  - ip: 10.0.0.1
  - ip: 10.0.0.2
"#;
        let config = parse_hosts(raw).unwrap();
        assert!(find_duplicate_ip(&config.hosts).is_none());
    }
}
