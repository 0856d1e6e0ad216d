use crate::{
    Error, Result,
    socks::ProxyConfig,
    transport::{DEFAULT_BUFFER_SIZE, TransportConfig},
};
use socks5_impl::protocol::UserKey;
use std::{net::ToSocketAddrs, path::PathBuf, time::Duration};

#[derive(Debug, Clone, clap::Parser)]
#[command(author, version, about = "Relay tunnel packets to a SOCKS5 proxy.", long_about = None)]
pub struct Args {
    /// Host name or IP address of the SOCKS5 proxy
    #[arg(long, alias = "proxyHost", value_name = "host")]
    pub proxy_host: String,

    /// Port of the SOCKS5 proxy
    #[arg(long, alias = "proxyPort", value_name = "port", value_parser = clap::value_parser!(u16).range(1..))]
    pub proxy_port: u16,

    /// Path to bind the unix datagram socket the tunnel writes packets to.
    /// The path must not exist yet.
    #[arg(long, alias = "inboundSocketPath", value_name = "path")]
    pub inbound_socket_path: PathBuf,

    /// Path of the tunnel's unix datagram socket that packets are written back to
    #[arg(long, alias = "outboundSocketPath", value_name = "path")]
    pub outbound_socket_path: PathBuf,

    /// Username for SOCKS5 username/password authentication
    #[arg(long, value_name = "name")]
    pub proxy_username: Option<String>,

    /// Password for SOCKS5 username/password authentication
    #[arg(long, value_name = "password", requires = "proxy_username")]
    pub proxy_password: Option<String>,

    /// Largest packet accepted from the tunnel, in bytes
    #[arg(long, value_name = "bytes", default_value = "1500", value_parser = clap::value_parser!(u16).range(576..))]
    pub mtu: u16,

    /// Socket buffer size requested for both tunnel sockets, in bytes
    #[arg(long, value_name = "bytes", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// TCP idle timeout in seconds
    #[arg(long, value_name = "seconds", default_value = "600")]
    pub tcp_timeout: u64,

    /// UDP idle timeout in seconds
    #[arg(long, value_name = "seconds", default_value = "30")]
    pub udp_timeout: u64,

    /// How long a forwarded DNS query waits for its response, in seconds
    #[arg(long, value_name = "seconds", default_value = "30")]
    pub dns_timeout: u64,

    /// Pass AAAA records in DNS responses through to clients
    #[arg(short = '6', long)]
    pub ipv6_enabled: bool,

    /// Verbosity level
    #[arg(short, long, value_name = "level", value_enum, default_value = "info")]
    pub verbosity: ArgVerbosity,
}

impl Args {
    /// Parses the process arguments. A missing or invalid argument prints the
    /// error and usage to stdout and exits with status 1.
    pub fn parse_args() -> Self {
        use clap::Parser;
        match Self::try_parse() {
            Ok(args) => args,
            Err(err) => match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => err.exit(),
                _ => {
                    println!("{}", err.render());
                    std::process::exit(1);
                }
            },
        }
    }

    pub fn new(proxy_host: &str, proxy_port: u16, inbound_socket_path: PathBuf, outbound_socket_path: PathBuf) -> Self {
        Args {
            proxy_host: proxy_host.to_string(),
            proxy_port,
            inbound_socket_path,
            outbound_socket_path,
            proxy_username: None,
            proxy_password: None,
            mtu: crate::relay::DEFAULT_MTU,
            buffer_size: DEFAULT_BUFFER_SIZE,
            tcp_timeout: 600,
            udp_timeout: 30,
            dns_timeout: 30,
            ipv6_enabled: false,
            verbosity: ArgVerbosity::Info,
        }
    }

    pub fn credentials(&mut self, username: &str, password: &str) -> &mut Self {
        self.proxy_username = Some(username.to_string());
        self.proxy_password = Some(password.to_string());
        self
    }

    pub fn mtu(&mut self, mtu: u16) -> &mut Self {
        self.mtu = mtu;
        self
    }

    pub fn tcp_timeout(&mut self, seconds: u64) -> &mut Self {
        self.tcp_timeout = seconds;
        self
    }

    pub fn udp_timeout(&mut self, seconds: u64) -> &mut Self {
        self.udp_timeout = seconds;
        self
    }

    pub fn dns_timeout(&mut self, seconds: u64) -> &mut Self {
        self.dns_timeout = seconds;
        self
    }

    pub fn ipv6_enabled(&mut self, ipv6_enabled: bool) -> &mut Self {
        self.ipv6_enabled = ipv6_enabled;
        self
    }

    pub fn verbosity(&mut self, verbosity: ArgVerbosity) -> &mut Self {
        self.verbosity = verbosity;
        self
    }

    /// Resolves the proxy host. Only the first address is used.
    pub fn proxy_config(&self) -> Result<ProxyConfig> {
        let host = self.proxy_host.as_str();
        let e = format!("`{host}` could not be resolved");
        let mut addr_iter = (host, self.proxy_port).to_socket_addrs().map_err(|_| Error::from(&e))?;

        let e = format!("`{host}` does not resolve to a usable IP address");
        let addr = addr_iter.next().ok_or(Error::from(&e))?;

        let credentials = self
            .proxy_username
            .as_ref()
            .map(|username| UserKey::new(username, self.proxy_password.as_deref().unwrap_or("")));
        Ok(ProxyConfig::new(addr, credentials))
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            inbound_path: self.inbound_socket_path.clone(),
            outbound_path: self.outbound_socket_path.clone(),
            read_buffer_bytes: self.buffer_size,
        }
    }

    pub fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_timeout)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_timeout)
    }

    pub fn dns_query_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout)
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum ArgVerbosity {
    Off = 0,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<ArgVerbosity> for log::LevelFilter {
    fn from(verbosity: ArgVerbosity) -> Self {
        match verbosity {
            ArgVerbosity::Off => log::LevelFilter::Off,
            ArgVerbosity::Error => log::LevelFilter::Error,
            ArgVerbosity::Warn => log::LevelFilter::Warn,
            ArgVerbosity::Info => log::LevelFilter::Info,
            ArgVerbosity::Debug => log::LevelFilter::Debug,
            ArgVerbosity::Trace => log::LevelFilter::Trace,
        }
    }
}

impl std::fmt::Display for ArgVerbosity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ArgVerbosity::Off => write!(f, "off"),
            ArgVerbosity::Error => write!(f, "error"),
            ArgVerbosity::Warn => write!(f, "warn"),
            ArgVerbosity::Info => write!(f, "info"),
            ArgVerbosity::Debug => write!(f, "debug"),
            ArgVerbosity::Trace => write!(f, "trace"),
        }
    }
}
