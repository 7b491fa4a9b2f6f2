//! Fixed roster of supervised services

use plugshare_core::{ServiceCommand, SupervisorConfig, SupervisorError};

pub const DEVICE_MONITOR: &str = "device-monitor";
pub const SHARE_CONTROLLER: &str = "share-controller";
pub const FILE_SERVER: &str = "file-server";

/// Services every roster must contain
pub const REQUIRED: [&str; 3] = [DEVICE_MONITOR, SHARE_CONTROLLER, FILE_SERVER];

/// Services restarted on a refresh request
pub const REFRESH_TARGETS: [&str; 2] = [DEVICE_MONITOR, SHARE_CONTROLLER];

/// Service restarted on the preventive schedule
pub const PREVENTIVE_TARGET: &str = DEVICE_MONITOR;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub command: ServiceCommand,
}

impl ServiceSpec {
    pub fn new(name: &str, command: ServiceCommand) -> Self {
        Self {
            name: name.to_string(),
            command,
        }
    }
}

/// Named services in start order
#[derive(Clone, Debug)]
pub struct Roster {
    services: Vec<ServiceSpec>,
}

impl Roster {
    /// Validate and freeze a roster. Every required name must appear exactly once.
    pub fn new(services: Vec<ServiceSpec>) -> Result<Self, SupervisorError> {
        for (i, spec) in services.iter().enumerate() {
            if spec.command.program.as_os_str().is_empty() {
                return Err(SupervisorError::InvalidRoster(format!(
                    "{} has no program",
                    spec.name
                )));
            }
            if services[..i].iter().any(|s| s.name == spec.name) {
                return Err(SupervisorError::InvalidRoster(format!(
                    "duplicate service {}",
                    spec.name
                )));
            }
        }
        for name in REQUIRED {
            if !services.iter().any(|s| s.name == name) {
                return Err(SupervisorError::InvalidRoster(format!("missing service {}", name)));
            }
        }
        Ok(Self { services })
    }

    /// Standard roster: device monitor, share controller, file server
    pub fn from_config(config: &SupervisorConfig) -> Result<Self, SupervisorError> {
        Self::new(vec![
            ServiceSpec::new(DEVICE_MONITOR, config.device_monitor.clone()),
            ServiceSpec::new(SHARE_CONTROLLER, config.share_controller.clone()),
            ServiceSpec::new(FILE_SERVER, config.file_server.clone()),
        ])
    }

    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|s| s.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec::new(name, ServiceCommand::new("/bin/true", &[]))
    }

    #[test]
    fn test_default_roster_order() {
        let roster = Roster::from_config(&SupervisorConfig::default()).unwrap();
        let names: Vec<&str> = roster.names().collect();
        assert_eq!(names, vec![DEVICE_MONITOR, SHARE_CONTROLLER, FILE_SERVER]);
        assert_eq!(roster.services()[0].command.args, vec!["devices"]);
    }

    #[test]
    fn test_missing_service_rejected() {
        let err = Roster::new(vec![spec(DEVICE_MONITOR), spec(FILE_SERVER)]).unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidRoster(_)));
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let err = Roster::new(vec![
            spec(DEVICE_MONITOR),
            spec(SHARE_CONTROLLER),
            spec(FILE_SERVER),
            spec(FILE_SERVER),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_empty_program_rejected() {
        let mut bad = spec(FILE_SERVER);
        bad.command.program = Default::default();
        let err = Roster::new(vec![spec(DEVICE_MONITOR), spec(SHARE_CONTROLLER), bad]).unwrap_err();
        assert!(err.to_string().contains("no program"));
    }
}
