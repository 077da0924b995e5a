//! Name resolution: turning a target URI into endpoint lists and service
//! configs.
//!
//! Resolvers are sans-io: `resolve_now` requests work and `poll_update`
//! surfaces results. A process-wide registry maps URI schemes to resolver
//! constructors; `dns`, `ipv4`, `ipv6`, and `unix` are built in, and plugin
//! schemes (such as `xds`) register through the same table.

use crate::address::{Address, Endpoint};
use crate::service_config::ServiceConfig;
use crate::uri::TargetUri;
use rpc_wire::Status;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, OnceLock};

/// Default port when a target names none.
pub const DEFAULT_PORT: u16 = 443;

/// The scheme assumed for targets whose own scheme is unregistered.
pub const DEFAULT_SCHEME: &str = "dns";

/// One resolution outcome.
#[derive(Debug, Clone)]
pub enum ResolverUpdate {
    /// Resolution produced an endpoint list, possibly with a service
    /// config (or a service-config parse failure).
    Resolved {
        endpoints: Vec<Endpoint>,
        service_config: Option<Result<ServiceConfig, Status>>,
    },
    /// Resolution itself failed.
    Failed(Status),
}

/// A name resolver for one target.
pub trait Resolver {
    /// Request (re-)resolution. Results surface through `poll_update`.
    fn resolve_now(&mut self);

    /// Take the next pending update, if any.
    fn poll_update(&mut self) -> Option<ResolverUpdate>;

    fn destroy(&mut self) {}
}

type ResolverFactory = fn(&TargetUri) -> Result<Box<dyn Resolver>, Status>;

fn registry() -> &'static Mutex<HashMap<String, ResolverFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, ResolverFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a resolver constructor for a scheme. Intended for process
/// startup; later registrations replace earlier ones.
pub fn register_resolver(scheme: &str, factory: ResolverFactory) {
    registry().lock().unwrap().insert(scheme.to_owned(), factory);
}

/// Register the built-in schemes. Idempotent.
pub fn register_defaults() {
    register_resolver("dns", |uri| DnsResolver::from_target(uri).map(boxed));
    register_resolver("ipv4", |uri| FixedResolver::from_ip_list(uri).map(boxed));
    register_resolver("ipv6", |uri| FixedResolver::from_ip_list(uri).map(boxed));
    register_resolver("unix", |uri| FixedResolver::from_unix(uri).map(boxed));
}

fn boxed<R: Resolver + 'static>(resolver: R) -> Box<dyn Resolver> {
    Box::new(resolver)
}

/// Whether the scheme has a registered resolver.
pub fn scheme_supported(scheme: &str) -> bool {
    registry().lock().unwrap().contains_key(scheme)
}

/// Build the resolver for a target. A target whose scheme is unknown is
/// retried as a path under [`DEFAULT_SCHEME`].
pub fn create_resolver(target: &str) -> Result<(TargetUri, Box<dyn Resolver>), Status> {
    register_defaults();
    let parse_err =
        |e: crate::uri::TargetParseError| Status::unavailable(e.to_string());

    let direct = TargetUri::parse(target).map_err(parse_err)?;
    let uri = match &direct.scheme {
        Some(scheme) if scheme_supported(scheme) => direct,
        _ => TargetUri::with_default_scheme(target, DEFAULT_SCHEME).map_err(parse_err)?,
    };
    let scheme = uri.scheme.clone().unwrap_or_default();
    let factory = registry()
        .lock()
        .unwrap()
        .get(&scheme)
        .copied()
        .ok_or_else(|| Status::unavailable(format!("No resolver for scheme {:?}", scheme)))?;
    let resolver = factory(&uri)?;
    Ok((uri, resolver))
}

/// The `:authority` to use for calls on a target when the caller provides
/// none.
pub fn default_authority(uri: &TargetUri) -> String {
    match uri.scheme.as_deref() {
        Some("unix") => "localhost".to_owned(),
        _ => uri.path.clone(),
    }
}

/// Split `host[:port]`, tolerating bracketed IPv6 literals.
fn split_host_port(path: &str) -> Result<(String, u16), Status> {
    let bad = || Status::unavailable(format!("Cannot parse target name {:?}", path));
    if path.is_empty() {
        return Err(bad());
    }
    if let Some(rest) = path.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(bad)?;
        match rest.strip_prefix(':') {
            Some(port) => Ok((host.to_owned(), port.parse().map_err(|_| bad())?)),
            None if rest.is_empty() => Ok((host.to_owned(), DEFAULT_PORT)),
            None => Err(bad()),
        }
    } else {
        match path.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                Ok((host.to_owned(), port.parse().map_err(|_| bad())?))
            }
            // More than one colon and no brackets: a bare IPv6 literal.
            Some(_) => Ok((path.to_owned(), DEFAULT_PORT)),
            None => Ok((path.to_owned(), DEFAULT_PORT)),
        }
    }
}

/// Resolver that always returns a fixed endpoint list (`ipv4:`, `ipv6:`,
/// `unix:` targets).
pub struct FixedResolver {
    endpoints: Vec<Endpoint>,
    pending: VecDeque<ResolverUpdate>,
}

impl FixedResolver {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            pending: VecDeque::new(),
        }
    }

    /// Parse a comma-separated `host:port` list (`ipv4:`/`ipv6:` targets).
    fn from_ip_list(uri: &TargetUri) -> Result<Self, Status> {
        let mut endpoints = Vec::new();
        for part in uri.path.split(',') {
            let (host, port) = split_host_port(part.trim())?;
            let addr: SocketAddr = format!(
                "{}:{}",
                if host.contains(':') { format!("[{}]", host) } else { host.clone() },
                port
            )
            .parse()
            .map_err(|_| {
                Status::unavailable(format!("Cannot parse IP address {:?}", part))
            })?;
            endpoints.push(Endpoint::from_address(Address::Tcp(addr)));
        }
        if endpoints.is_empty() {
            return Err(Status::unavailable("No addresses in target"));
        }
        Ok(Self::new(endpoints))
    }

    fn from_unix(uri: &TargetUri) -> Result<Self, Status> {
        if uri.path.is_empty() {
            return Err(Status::unavailable("Empty unix socket path"));
        }
        Ok(Self::new(vec![Endpoint::from_address(Address::Unix(
            uri.path.clone(),
        ))]))
    }
}

impl Resolver for FixedResolver {
    fn resolve_now(&mut self) {
        self.pending.push_back(ResolverUpdate::Resolved {
            endpoints: self.endpoints.clone(),
            service_config: None,
        });
    }

    fn poll_update(&mut self) -> Option<ResolverUpdate> {
        self.pending.pop_front()
    }
}

/// Hostname lookup seam; the default uses the standard library's blocking
/// resolution.
pub type LookupFn = Arc<dyn Fn(&str, u16) -> io::Result<Vec<SocketAddr>> + Send + Sync>;

/// DNS resolver over a pluggable lookup function.
pub struct DnsResolver {
    host: String,
    port: u16,
    lookup: LookupFn,
    pending: VecDeque<ResolverUpdate>,
}

impl DnsResolver {
    pub fn from_target(uri: &TargetUri) -> Result<Self, Status> {
        let (host, port) = split_host_port(&uri.path)?;
        Ok(Self {
            host,
            port,
            lookup: Arc::new(|host, port| {
                Ok((host, port).to_socket_addrs()?.collect())
            }),
            pending: VecDeque::new(),
        })
    }

    /// Replace the lookup function (tests, custom resolution libraries).
    pub fn with_lookup(mut self, lookup: LookupFn) -> Self {
        self.lookup = lookup;
        self
    }
}

impl Resolver for DnsResolver {
    fn resolve_now(&mut self) {
        let update = match (self.lookup)(&self.host, self.port) {
            Ok(addrs) if !addrs.is_empty() => ResolverUpdate::Resolved {
                endpoints: addrs
                    .into_iter()
                    .map(|a| Endpoint::from_address(Address::Tcp(a)))
                    .collect(),
                service_config: None,
            },
            Ok(_) => ResolverUpdate::Failed(Status::unavailable(format!(
                "Name resolution returned no addresses for {:?}",
                self.host
            ))),
            Err(e) => ResolverUpdate::Failed(Status::unavailable(format!(
                "Name resolution failed for {:?}: {}",
                self.host, e
            ))),
        };
        tracing::debug!(
            target: "rpc_channel::resolver",
            host = %self.host,
            ok = matches!(update, ResolverUpdate::Resolved { .. }),
            "dns resolution finished"
        );
        self.pending.push_back(update);
    }

    fn poll_update(&mut self) -> Option<ResolverUpdate> {
        self.pending.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:50051").unwrap(),
            ("example.com".to_owned(), 50051)
        );
        assert_eq!(
            split_host_port("example.com").unwrap(),
            ("example.com".to_owned(), DEFAULT_PORT)
        );
        assert_eq!(
            split_host_port("[::1]:80").unwrap(),
            ("::1".to_owned(), 80)
        );
        assert_eq!(split_host_port("::1").unwrap(), ("::1".to_owned(), DEFAULT_PORT));
        assert!(split_host_port("host:notaport").is_err());
        assert!(split_host_port("").is_err());
    }

    #[test]
    fn test_ipv4_resolver() {
        let (_, mut resolver) = create_resolver("ipv4:127.0.0.1:8080,127.0.0.2:9090").unwrap();
        resolver.resolve_now();
        let Some(ResolverUpdate::Resolved { endpoints, .. }) = resolver.poll_update() else {
            panic!("expected endpoints");
        };
        assert_eq!(endpoints.len(), 2);
        assert_eq!(
            endpoints[0].addresses[0],
            Address::Tcp("127.0.0.1:8080".parse().unwrap())
        );
    }

    #[test]
    fn test_ipv6_resolver() {
        let (_, mut resolver) = create_resolver("ipv6:[::1]:8080").unwrap();
        resolver.resolve_now();
        let Some(ResolverUpdate::Resolved { endpoints, .. }) = resolver.poll_update() else {
            panic!("expected endpoints");
        };
        assert_eq!(
            endpoints[0].addresses[0],
            Address::Tcp("[::1]:8080".parse().unwrap())
        );
    }

    #[test]
    fn test_unix_resolver() {
        let (uri, mut resolver) = create_resolver("unix:/run/svc.sock").unwrap();
        resolver.resolve_now();
        let Some(ResolverUpdate::Resolved { endpoints, .. }) = resolver.poll_update() else {
            panic!("expected endpoints");
        };
        assert_eq!(endpoints[0].addresses[0], Address::Unix("/run/svc.sock".into()));
        assert_eq!(default_authority(&uri), "localhost");
    }

    #[test]
    fn test_bad_ipv4_target_rejected() {
        assert!(create_resolver("ipv4:not-an-ip:80").is_err());
    }

    #[test]
    fn test_unknown_scheme_falls_back_to_dns() {
        // "localhost:50051" parses with scheme "localhost", which is not
        // registered, so the whole target becomes a dns path.
        let (uri, _resolver) = create_resolver("localhost:50051").unwrap();
        assert_eq!(uri.scheme.as_deref(), Some("dns"));
        assert_eq!(uri.path, "localhost:50051");
        assert_eq!(default_authority(&uri), "localhost:50051");
    }

    #[test]
    fn test_dns_resolver_with_custom_lookup() {
        let uri = TargetUri::parse("dns:svc.test:443").unwrap();
        let mut resolver = DnsResolver::from_target(&uri).unwrap().with_lookup(Arc::new(
            |host, port| {
                assert_eq!(host, "svc.test");
                Ok(vec![SocketAddr::new("10.1.2.3".parse().unwrap(), port)])
            },
        ));
        resolver.resolve_now();
        let Some(ResolverUpdate::Resolved { endpoints, .. }) = resolver.poll_update() else {
            panic!("expected endpoints");
        };
        assert_eq!(
            endpoints[0].addresses[0],
            Address::Tcp("10.1.2.3:443".parse().unwrap())
        );
    }

    #[test]
    fn test_dns_resolver_failure_update() {
        let uri = TargetUri::parse("dns:svc.test").unwrap();
        let mut resolver = DnsResolver::from_target(&uri).unwrap().with_lookup(Arc::new(
            |_, _| Err(io::Error::new(io::ErrorKind::NotFound, "NXDOMAIN")),
        ));
        resolver.resolve_now();
        let Some(ResolverUpdate::Failed(status)) = resolver.poll_update() else {
            panic!("expected failure");
        };
        assert!(status.details().contains("svc.test"));
    }

    #[test]
    fn test_plugin_scheme_registration() {
        register_resolver("fixed-test", |_uri| {
            Ok(Box::new(FixedResolver::new(vec![Endpoint::from_address(
                Address::Tcp("127.0.0.1:1".parse().unwrap()),
            )])))
        });
        assert!(scheme_supported("fixed-test"));
        let (uri, _resolver) = create_resolver("fixed-test:whatever").unwrap();
        assert_eq!(uri.scheme.as_deref(), Some("fixed-test"));
    }
}
