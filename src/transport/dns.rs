use futures::{future::select_ok, FutureExt};
use hickory_resolver::{
    config::LookupIpStrategy, name_server::TokioConnectionProvider, IntoName, TokioAsyncResolver,
};
use log::debug;
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpSocket, TcpStream};

use crate::Error;

/// Where and how to reach the XMPP server over TCP.
#[derive(Clone, Debug)]
pub enum DnsConfig {
    /// Use SRV records to find the server host
    UseSrv {
        /// Hostname to resolve
        host: String,
        /// Service label, eg. _xmpp-client._tcp
        srv: String,
        /// When SRV resolution fails what port to use
        fallback_port: u16,
    },

    /// Manually defined server host and port
    NoSrv {
        /// Server host name
        host: String,
        /// Server port
        port: u16,
    },

    /// Manually defined IP:port
    Addr {
        /// IP:port
        addr: String,
    },
}

impl std::fmt::Display for DnsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UseSrv { host, .. } => write!(f, "{}", host),
            Self::NoSrv { host, port } => write!(f, "{}:{}", host, port),
            Self::Addr { addr } => write!(f, "{}", addr),
        }
    }
}

impl DnsConfig {
    /// Constructor for the DnsConfig::UseSrv variant
    pub fn srv(host: &str, srv: &str, fallback_port: u16) -> Self {
        Self::UseSrv {
            host: host.to_string(),
            srv: srv.to_string(),
            fallback_port,
        }
    }

    /// The default SRV resolution strategy for clients
    pub fn srv_default_client(host: &str) -> Self {
        Self::UseSrv {
            host: host.to_string(),
            srv: "_xmpp-client._tcp".to_string(),
            fallback_port: 5222,
        }
    }

    /// Constructor for the DnsConfig::NoSrv variant
    pub fn no_srv(host: &str, port: u16) -> Self {
        Self::NoSrv {
            host: host.to_string(),
            port,
        }
    }

    /// Constructor for the DnsConfig::Addr variant
    pub fn addr(addr: &str) -> Self {
        Self::Addr {
            addr: addr.to_string(),
        }
    }

    /// Resolve to a connected `TcpStream`, optionally binding the
    /// local endpoint first.
    pub async fn resolve(&self, local: Option<SocketAddr>) -> Result<TcpStream, Error> {
        match self {
            Self::UseSrv {
                host,
                srv,
                fallback_port,
            } => Self::resolve_srv(host, srv, *fallback_port, local).await,
            Self::NoSrv { host, port } => Self::resolve_no_srv(host, *port, local).await,
            Self::Addr { addr } => {
                let addr: SocketAddr = addr.parse()?;
                connect(addr, local).await
            }
        }
    }

    async fn resolve_srv(
        host: &str,
        srv: &str,
        fallback_port: u16,
        local: Option<SocketAddr>,
    ) -> Result<TcpStream, Error> {
        let ascii_domain = idna::domain_to_ascii(host)?;

        if let Ok(ip) = ascii_domain.parse::<IpAddr>() {
            debug!("Attempting connection to {ip}:{fallback_port}");
            return connect(SocketAddr::new(ip, fallback_port), local).await;
        }

        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;

        let srv_domain = format!("{}.{}.", srv, ascii_domain).into_name()?;
        let srv_records = resolver.srv_lookup(srv_domain.clone()).await.ok();

        match srv_records {
            Some(lookup) => {
                // TODO: sort lookup records by priority/weight
                for record in lookup.iter() {
                    debug!("Attempting connection to {srv_domain} {record}");
                    if let Ok(stream) =
                        Self::resolve_no_srv(&record.target().to_ascii(), record.port(), local)
                            .await
                    {
                        return Ok(stream);
                    }
                }
                Err(Error::Disconnected)
            }
            None => {
                // SRV lookup error, retry with hostname
                debug!("Attempting connection to {host}:{fallback_port}");
                Self::resolve_no_srv(host, fallback_port, local).await
            }
        }
    }

    async fn resolve_no_srv(
        host: &str,
        port: u16,
        local: Option<SocketAddr>,
    ) -> Result<TcpStream, Error> {
        let ascii_domain = idna::domain_to_ascii(host)?;

        if let Ok(ip) = ascii_domain.parse::<IpAddr>() {
            return connect(SocketAddr::new(ip, port), local).await;
        }

        let (config, mut options) = hickory_resolver::system_conf::read_system_conf()?;
        options.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        let resolver = TokioAsyncResolver::new(config, options, TokioConnectionProvider::default());

        let ips = resolver.lookup_ip(ascii_domain).await?;

        if local.is_some() {
            // A bound source endpoint cannot be shared between parallel
            // attempts; try the records one by one.
            for ip in ips {
                if let Ok(stream) = connect(SocketAddr::new(ip, port), local).await {
                    return Ok(stream);
                }
            }
            return Err(Error::Disconnected);
        }

        // Happy Eyeballs: connect to all records in parallel, return the
        // first to succeed
        select_ok(
            ips.into_iter()
                .map(|ip| TcpStream::connect(SocketAddr::new(ip, port)).boxed()),
        )
        .await
        .map(|(result, _)| result)
        .map_err(|_| Error::Disconnected)
    }
}

async fn connect(addr: SocketAddr, local: Option<SocketAddr>) -> Result<TcpStream, Error> {
    match local {
        None => Ok(TcpStream::connect(addr).await?),
        Some(local) => {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(local)?;
            Ok(socket.connect(addr).await?)
        }
    }
}
