//! Port allocation for discovered backends
//!
//! A port counts as available when a listener can be bound to it and
//! released again. Nothing is reserved between the probe and the moment
//! the backend binds the port itself, so another process may take it in
//! between.

use crate::app::AppDefinition;
use crate::error::PortExhausted;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Probes a port range for ports that can currently be bound
#[derive(Debug, Clone)]
pub struct PortScanner {
    host: IpAddr,
    start: u16,
    end: u16,
}

impl PortScanner {
    pub fn new(host: IpAddr, start: u16, end: u16) -> Self {
        Self { host, start, end }
    }

    /// Check a single port by binding and immediately dropping a listener
    pub async fn is_available(&self, port: u16) -> bool {
        match TcpListener::bind((self.host, port)).await {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(_) => false,
        }
    }

    /// Scan the whole range, lowest port first
    pub async fn scan(&self) -> AvailablePorts {
        let started = Instant::now();
        info!(host = %self.host, start = self.start, end = self.end, "Scanning for open ports");

        let mut ports = VecDeque::new();
        if self.start <= self.end {
            for port in self.start..=self.end {
                if self.is_available(port).await {
                    ports.push_back(port);
                } else {
                    debug!(port, "Port is in use");
                }
            }
        }

        info!(
            found = ports.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Port scan complete"
        );

        AvailablePorts {
            ports,
            start: self.start,
            end: self.end,
        }
    }
}

/// Ports found free by a scan, consumed front to back
#[derive(Debug, Clone)]
pub struct AvailablePorts {
    ports: VecDeque<u16>,
    start: u16,
    end: u16,
}

impl AvailablePorts {
    pub fn from_ports(ports: impl IntoIterator<Item = u16>, start: u16, end: u16) -> Self {
        Self {
            ports: ports.into_iter().collect(),
            start,
            end,
        }
    }

    /// Take the lowest remaining port
    pub fn next_port(&mut self) -> Result<u16, PortExhausted> {
        self.ports.pop_front().ok_or(PortExhausted {
            start: self.start,
            end: self.end,
        })
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn as_slice(&self) -> Vec<u16> {
        self.ports.iter().copied().collect()
    }
}

/// Give every discovered definition a port, in discovery order
pub fn assign_ports(
    apps: impl IntoIterator<Item = AppDefinition>,
    ports: &mut AvailablePorts,
) -> Result<Vec<AppDefinition>, PortExhausted> {
    apps.into_iter()
        .map(|app| {
            let port = ports.next_port()?;
            debug!(app = %app.name, port, "Assigned port");
            Ok(app.with_port(port))
        })
        .collect()
}
