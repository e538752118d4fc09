use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{debug, info, warn};

pub const SERVICE_TYPE: &str = "_devdeck._tcp.local.";
pub const INSTANCE_NAME: &str = "DevDeck";
const TXT_RECORDS: [(&str, &str); 3] = [("txtv", "0"), ("lo", "1"), ("la", "2")];
const FALLBACK_HOST: &str = "devdeck-hub";

/// LAN advertisement so clients can find the server without typing an address.
pub struct Advertisement {
    daemon: ServiceDaemon,
    fullname: String,
}

pub fn advertise(port: u16) -> Result<Advertisement> {
    let hostname = gethostname::gethostname();
    let service = service_record(&host_label(hostname.to_str()), port)?;
    let fullname = service.get_fullname().to_string();
    let host = service.get_hostname().to_string();
    let daemon = ServiceDaemon::new().context("failed to start mDNS daemon")?;
    daemon
        .register(service)
        .context("failed to register service")?;
    info!(event = "discovery_registered", service = %fullname, host = %host, port = port);
    Ok(Advertisement { daemon, fullname })
}

impl Advertisement {
    pub fn stop(self) {
        if let Err(err) = self.daemon.unregister(&self.fullname) {
            warn!(event = "discovery_unregister_failed", error = %err);
        }
        if let Err(err) = self.daemon.shutdown() {
            warn!(event = "discovery_shutdown_failed", error = %err);
        }
        info!(event = "discovery_stopped", service = %self.fullname);
    }
}

/// Record with no fixed address; the daemon publishes every interface
/// address and follows interfaces coming and going.
fn service_record(host: &str, port: u16) -> Result<ServiceInfo> {
    let hostname = format!("{host}.local.");
    let service = ServiceInfo::new(SERVICE_TYPE, INSTANCE_NAME, &hostname, "", port, &TXT_RECORDS[..])
        .context("invalid service record")?;
    Ok(service.enable_addr_auto())
}

fn host_label(hostname: Option<&str>) -> String {
    let label: String = hostname
        .unwrap_or_default()
        .split('.')
        .next()
        .unwrap_or_default()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '-' })
        .collect();
    if label.trim_matches('-').is_empty() {
        FALLBACK_HOST.to_string()
    } else {
        label
    }
}

pub fn log_interfaces() {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            let grouped = group_addresses(
                interfaces
                    .into_iter()
                    .map(|interface| (interface.name.clone(), interface.ip())),
            );
            for (name, addrs) in grouped {
                debug!(event = "network_interface", name = %name, addrs = %addrs.join(", "));
            }
        }
        Err(err) => debug!(event = "network_interface_error", error = %err),
    }
}

fn group_addresses(entries: impl IntoIterator<Item = (String, IpAddr)>) -> BTreeMap<String, Vec<String>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, ip) in entries {
        grouped.entry(name).or_default().push(ip.to_string());
    }
    grouped
}
