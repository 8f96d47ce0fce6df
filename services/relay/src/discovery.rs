//! LAN discovery: DNS-SD registration plus operator-facing address logs.
//!
//! Registration failure is never fatal — operators can always announce an
//! address by hand, so every non-loopback site-local IPv4 is logged with
//! the web port as the fallback.

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{info, warn};

pub const SERVICE_TYPE: &str = "_helphub._tcp.local.";

/// Handle to an active DNS-SD registration.  Dropping it without calling
/// [`Discovery::shutdown`] leaves the record to expire on its own TTL.
pub struct Discovery {
    daemon: ServiceDaemon,
    fullname: String,
}

/// Register the relay on the link-local discovery facility.
///
/// Returns `None` (after a warning) when the platform has no usable
/// multicast facility; the server carries on without it.
pub fn announce(instance_name: &str, web_port: u16) -> Option<Discovery> {
    let daemon = match ServiceDaemon::new() {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "mDNS daemon unavailable; discovery disabled");
            return None;
        }
    };

    let host = format!("{instance_name}.local.");
    let props = [("version", env!("CARGO_PKG_VERSION"))];
    let info = match ServiceInfo::new(SERVICE_TYPE, instance_name, &host, "", web_port, &props[..])
    {
        Ok(i) => i.enable_addr_auto(),
        Err(e) => {
            warn!(error = %e, "mDNS service info rejected; discovery disabled");
            return None;
        }
    };
    let fullname = info.get_fullname().to_owned();

    match daemon.register(info) {
        Ok(()) => {
            info!(service = %fullname, "registered on mDNS");
            Some(Discovery { daemon, fullname })
        }
        Err(e) => {
            warn!(error = %e, "mDNS registration failed; continuing without discovery");
            None
        }
    }
}

impl Discovery {
    /// Unregister and stop the daemon (clean shutdown path).
    pub fn shutdown(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!(error = %e, "mDNS unregister failed");
        }
        let _ = self.daemon.shutdown();
    }
}

/// Log every non-loopback site-local IPv4 address with the web port so
/// operators can announce a fallback when discovery is unavailable.
pub fn log_lan_addresses(web_port: u16) {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, "interface enumeration failed");
            return;
        }
    };
    for iface in interfaces {
        if let std::net::IpAddr::V4(addr) = iface.ip() {
            if !addr.is_loopback() && (addr.is_private() || addr.is_link_local()) {
                info!(address = %format!("http://{addr}:{web_port}"), interface = %iface.name, "reachable on");
            }
        }
    }
}
