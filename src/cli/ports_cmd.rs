//! `ports` subcommand: list serial adapters and show which roles resolve.

use serde::Serialize;

use crate::serial::{DiscoveredPorts, PortDescriptor, PortManager, PortsConfig};

/// Adapter list plus the outcome of role discovery.
#[derive(Debug, Clone, Serialize)]
pub struct PortsReport {
    pub ports: Vec<PortDescriptor>,
    pub resolved: Option<DiscoveredPorts>,
    pub error: Option<String>,
}

impl PortsReport {
    pub fn collect(manager: &mut PortManager) -> Self {
        let ports = match manager.available() {
            Ok(ports) => ports,
            Err(e) => {
                return Self {
                    ports: Vec::new(),
                    resolved: None,
                    error: Some(e.to_string()),
                }
            }
        };
        match manager.discover() {
            Ok(found) => Self {
                ports,
                resolved: Some(found),
                error: None,
            },
            Err(e) => Self {
                ports,
                resolved: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// 0 when both roles resolved, 3 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.resolved.is_some() {
            0
        } else {
            3
        }
    }

    fn print_text(&self) {
        if self.ports.is_empty() {
            println!("No serial adapters found.");
        }
        for port in &self.ports {
            println!("{:<16} {}", port.name, port.description);
        }
        match (&self.resolved, &self.error) {
            (Some(found), _) => {
                println!();
                println!("relay:  {}", found.relay);
                println!("device: {}", found.device);
            }
            (None, Some(error)) => eprintln!("ERROR: {error}"),
            (None, None) => {}
        }
    }
}

/// List adapters against the OS port catalog.
pub fn run_list(config: &PortsConfig, json: bool) -> i32 {
    let mut manager = PortManager::system(config.clone());
    let report = PortsReport::collect(&mut manager);
    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("ERROR: {e}");
                return 1;
            }
        }
    } else {
        report.print_text();
    }
    report.exit_code()
}
