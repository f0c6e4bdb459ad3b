use futures::future;
use futures::stream::{self, Stream, StreamExt};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::error::Result;
use crate::peer::{PeerEvent, PeerRecord};
use crate::protocol::LocalDevice;

/// How long to wait for the daemon to confirm the goodbye packet went out.
const UNREGISTER_WAIT: Duration = Duration::from_secs(1);

type EventStream = Pin<Box<dyn Stream<Item = ServiceEvent> + Send>>;

/// `chat-peer` -> `_chat-peer._tcp.local.`
pub fn service_type(service_class: &str) -> String {
    format!("_{}._tcp.local.", service_class.trim_start_matches('_'))
}

/// Local-network announcement and browse over mDNS.
pub struct Discovery {
    daemon: ServiceDaemon,
    service_type: String,
    registered_service: Option<String>, // fullname of our registration
}

impl Discovery {
    pub fn new(service_class: &str) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        Ok(Self {
            daemon,
            service_type: service_type(service_class),
            registered_service: None,
        })
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Announces `device` under the service class. Safe to call again after
    /// an interface change; the previous registration is withdrawn first.
    pub fn publish(&mut self, device: &LocalDevice) -> Result<()> {
        if let Some(fullname) = self.registered_service.take() {
            tracing::info!("Unregistering old service: {}", fullname);
            let _ = self.daemon.unregister(&fullname);
        }

        let m_hostname = format!("{}.local.", mdns_host_label(&device.name));
        let ip = device.ip.to_string();
        let properties = [
            ("deviceName", device.name.as_str()),
            ("version", env!("CARGO_PKG_VERSION")),
            ("ip", ip.as_str()),
        ];

        let service_info = ServiceInfo::new(
            &self.service_type,
            &device.name,
            &m_hostname,
            ip.as_str(),
            device.port,
            &properties[..],
        )?;
        let fullname = service_info.get_fullname().to_string();

        self.daemon.register(service_info)?;
        tracing::info!("Published {} at {}:{}", fullname, device.ip, device.port);

        self.registered_service = Some(fullname);
        Ok(())
    }

    /// Lazy, infinite stream of membership changes for our service class.
    ///
    /// The daemon reports an instance once and stays silent while its TTL is
    /// refreshed, so the browse is restarted every `refresh_every`. A restart
    /// replays every cached instance as a fresh `Up`, which is what keeps
    /// live peers ahead of the directory sweep. Pick an interval shorter than
    /// the staleness window.
    pub fn browse(
        &self,
        refresh_every: Duration,
    ) -> Result<impl Stream<Item = PeerEvent> + Send + 'static> {
        let initial = receiver_stream(self.daemon.browse(&self.service_type)?);

        let daemon = self.daemon.clone();
        let ty = self.service_type.clone();
        let resubscribe = move || match daemon.browse(&ty) {
            Ok(receiver) => {
                tracing::debug!("Refreshing browse for {}", ty);
                Some(receiver_stream(receiver))
            }
            Err(e) => {
                tracing::warn!("Failed to refresh browse for {}: {}", ty, e);
                None
            }
        };

        let service_type = self.service_type.clone();
        let mut known: HashMap<String, PeerRecord> = HashMap::new();
        Ok(resubscribing(initial, resubscribe, refresh_every)
            .filter_map(move |event| future::ready(translate_event(&service_type, event, &mut known))))
    }

    /// Withdraws the announcement and waits briefly for the goodbye to go out
    /// so peers evict us without waiting for their sweep.
    pub async fn unpublish(&mut self) -> Result<()> {
        let Some(fullname) = self.registered_service.take() else {
            return Ok(());
        };
        let status = self.daemon.unregister(&fullname)?;
        match tokio::time::timeout(UNREGISTER_WAIT, status.recv_async()).await {
            Ok(Ok(status)) => tracing::info!("Unpublished {}: {:?}", fullname, status),
            Ok(Err(_)) => tracing::warn!("Daemon closed before confirming unpublish of {}", fullname),
            Err(_) => tracing::warn!("Timed out waiting for unpublish of {}", fullname),
        }
        Ok(())
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if let Some(fullname) = self.registered_service.take() {
            tracing::info!("Unregistering service on drop: {}", fullname);
            match self.daemon.unregister(&fullname) {
                // Give the daemon time to send the goodbye packet before its thread goes away
                Ok(status) => {
                    let _ = status.recv_timeout(Duration::from_millis(300));
                }
                Err(e) => tracing::error!("Failed to unregister service: {}", e),
            }
        }
        let _ = self.daemon.shutdown();
    }
}

fn receiver_stream(receiver: mdns_sd::Receiver<ServiceEvent>) -> EventStream {
    Box::pin(stream::unfold(receiver, |receiver| async move {
        let event = receiver.recv_async().await.ok()?;
        Some((event, receiver))
    }))
}

enum Step<T> {
    Item(T),
    Ended,
    Refresh,
}

/// Follows `initial`, swapping in a fresh stream from `subscribe` every
/// `refresh_every`. A failed resubscribe keeps the current stream. Ends when
/// the current stream ends.
fn resubscribing<T, S, F>(initial: S, subscribe: F, refresh_every: Duration) -> impl Stream<Item = T>
where
    S: Stream<Item = T> + Unpin,
    F: FnMut() -> Option<S>,
{
    stream::unfold(
        (initial, subscribe, None::<Interval>),
        move |(mut current, mut subscribe, ticker)| async move {
            let mut ticker = ticker.unwrap_or_else(|| {
                let mut ticker = tokio::time::interval_at(Instant::now() + refresh_every, refresh_every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });
            loop {
                // Drain what the current subscription already holds before swapping it out
                let step = tokio::select! {
                    biased;
                    item = current.next() => match item {
                        Some(item) => Step::Item(item),
                        None => Step::Ended,
                    },
                    _ = ticker.tick() => Step::Refresh,
                };
                match step {
                    Step::Item(item) => return Some((item, (current, subscribe, Some(ticker)))),
                    Step::Ended => return None,
                    Step::Refresh => {
                        if let Some(fresh) = subscribe() {
                            current = fresh;
                        }
                    }
                }
            }
        },
    )
}

fn translate_event(
    service_type: &str,
    event: ServiceEvent,
    known: &mut HashMap<String, PeerRecord>,
) -> Option<PeerEvent> {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            let fullname = info.get_fullname().to_string();
            let addresses: Vec<String> = info
                .get_addresses()
                .iter()
                .map(|addr| addr.to_string())
                .collect();
            let attributes: HashMap<String, String> = info
                .get_properties()
                .iter()
                .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
                .collect();

            let name = instance_name(service_type, &fullname);
            let host = info.get_hostname().to_string();
            let record = PeerRecord {
                id: PeerRecord::peer_id(&name, &host),
                display_name: name,
                address: pick_address(&addresses).unwrap_or_else(|| host.trim_end_matches('.').to_string()),
                port: info.get_port(),
                attributes,
                last_seen_at: chrono::Utc::now(),
            };
            tracing::debug!("Service resolved: {} at {}", record.id, record.address);
            known.insert(fullname, record.clone());
            Some(PeerEvent::Up(record))
        }
        ServiceEvent::ServiceRemoved(_ty, fullname) => {
            tracing::debug!("Service removed: {}", fullname);
            known.remove(&fullname).map(PeerEvent::Down)
        }
        _ => None,
    }
}

/// `Alice's Laptop._chat-peer._tcp.local.` -> `Alice's Laptop`
fn instance_name(service_type: &str, fullname: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|name| name.trim_end_matches('.'))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| fullname.split('.').next().unwrap_or("unknown"))
        .to_string()
}

/// First resolvable address, IPv4 preferred. IPv6 zone suffixes are kept.
fn pick_address(addresses: &[String]) -> Option<String> {
    let parsed: Vec<(&String, IpAddr)> = addresses
        .iter()
        .filter_map(|raw| {
            let bare = raw.split('%').next().unwrap_or(raw);
            bare.parse::<IpAddr>().ok().map(|ip| (raw, ip))
        })
        .collect();

    parsed
        .iter()
        .find(|(_, ip)| ip.is_ipv4())
        .or_else(|| parsed.first())
        .map(|(raw, _)| (*raw).clone())
}

/// The id other devices derive for `device_name` once they resolve our
/// announcement.
pub fn local_peer_id(device_name: &str) -> String {
    PeerRecord::peer_id(device_name, &format!("{}.local.", mdns_host_label(device_name)))
}

fn mdns_host_label(name: &str) -> String {
    let label: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if label.is_empty() {
        "peerlink".to_string()
    } else {
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_is_tcp_local() {
        assert_eq!(service_type("chat-peer"), "_chat-peer._tcp.local.");
        assert_eq!(service_type("_chat-peer"), "_chat-peer._tcp.local.");
    }

    #[test]
    fn instance_name_keeps_dots_in_names() {
        let ty = service_type("chat-peer");
        assert_eq!(instance_name(&ty, "bob.laptop._chat-peer._tcp.local."), "bob.laptop");
        assert_eq!(instance_name(&ty, "weird.other.local."), "weird");
    }

    #[test]
    fn pick_address_prefers_ipv4() {
        let addrs = vec!["fe80::1%en0".to_string(), "192.168.1.4".to_string()];
        assert_eq!(pick_address(&addrs).as_deref(), Some("192.168.1.4"));

        let v6_only = vec!["fe80::1%en0".to_string()];
        assert_eq!(pick_address(&v6_only).as_deref(), Some("fe80::1%en0"));

        assert_eq!(pick_address(&["garbage".to_string()]), None);
    }

    #[test]
    fn host_label_replaces_spaces() {
        assert_eq!(mdns_host_label("Alice's Laptop"), "Alice-s-Laptop");
        assert_eq!(mdns_host_label(""), "peerlink");
    }

    fn counting(values: Vec<u32>) -> stream::BoxStream<'static, u32> {
        stream::iter(values).chain(stream::pending()).boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribing_replays_on_every_refresh() {
        let mut subscriptions = 0;
        let events = resubscribing(
            counting(vec![0]),
            move || {
                subscriptions += 1;
                Some(counting(vec![subscriptions]))
            },
            Duration::from_secs(20),
        );
        futures::pin_mut!(events);

        assert_eq!(events.next().await, Some(0));
        let started = Instant::now();
        assert_eq!(events.next().await, Some(1));
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert_eq!(events.next().await, Some(2));
        assert!(started.elapsed() >= Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribing_keeps_current_stream_when_refresh_fails() {
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&attempts);
        let (tx, rx) = futures::channel::mpsc::unbounded::<u32>();
        let events = resubscribing(
            rx.boxed(),
            move || {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                None
            },
            Duration::from_secs(5),
        );
        futures::pin_mut!(events);

        let idle = tokio::time::timeout(Duration::from_secs(12), events.next()).await;
        assert!(idle.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);

        tx.unbounded_send(9).unwrap();
        assert_eq!(events.next().await, Some(9));
        drop(tx);
        assert_eq!(events.next().await, None);
    }

    #[test]
    fn local_peer_id_matches_resolved_form() {
        assert_eq!(local_peer_id("desk"), "desk-desk.local.");
        assert_eq!(local_peer_id("Alice's Laptop"), "Alice's Laptop-Alice-s-Laptop.local.");
    }
}
