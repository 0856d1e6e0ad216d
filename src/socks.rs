use crate::error::Result;
use socks5_impl::protocol::{self, Address, AuthMethod, Command, Reply, StreamOperation, UdpHeader, UserKey, handshake, password_method};
use std::{net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

/// Upper bound on establishing the TCP connection to the proxy.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Location of the SOCKS5 backend and the credentials to present to it.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub addr: SocketAddr,
    pub credentials: Option<UserKey>,
}

impl ProxyConfig {
    pub fn new(addr: SocketAddr, credentials: Option<UserKey>) -> Self {
        Self { addr, credentials }
    }

    pub async fn connect_backend(&self) -> Result<TcpStream> {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr)).await {
            Ok(stream) => {
                let stream = stream?;
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Err(_) => Err(format!("connect to proxy {} timed out", self.addr).into()),
        }
    }
}

/// Reads one SOCKS message, pulling more bytes from `stream` until the
/// message decodes. Surplus bytes stay in `inbuf`.
async fn read_message<T, S>(stream: &mut S, inbuf: &mut Vec<u8>) -> std::io::Result<T>
where
    T: StreamOperation,
    S: AsyncRead + Unpin,
{
    loop {
        match T::retrieve_from_stream(&mut inbuf.as_slice()) {
            Ok(message) => {
                inbuf.drain(..message.len());
                return Ok(message);
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                log::trace!("SOCKS5 message needs more data \"{}\"...", e);
            }
            Err(e) => return Err(e),
        }
        let mut buf = [0_u8; 512];
        let len = stream.read(&mut buf).await?;
        if len == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "SOCKS5 server closed the connection during handshake",
            ));
        }
        inbuf.extend_from_slice(&buf[..len]);
    }
}

/// Runs the method negotiation, optional authentication and `command`. Returns
/// the bound address from the reply and whatever the server sent after it.
async fn negotiate<S>(
    stream: &mut S,
    command: Command,
    target: Address,
    credentials: &Option<UserKey>,
) -> Result<(Address, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut outbuf = Vec::<u8>::new();
    let mut inbuf = Vec::<u8>::new();

    let mut methods = vec![AuthMethod::NoAuth];
    if credentials.is_some() {
        methods.push(AuthMethod::UserPass);
    }
    handshake::Request::new(methods).write_to_stream(&mut outbuf)?;
    stream.write_all(&outbuf).await?;

    let response: handshake::Response = read_message(stream, &mut inbuf).await?;
    match (response.method, credentials) {
        (AuthMethod::NoAuth, _) => {}
        (AuthMethod::UserPass, Some(credentials)) => {
            outbuf.clear();
            password_method::Request::new(&credentials.username, &credentials.password).write_to_stream(&mut outbuf)?;
            stream.write_all(&outbuf).await?;
            let response: password_method::Response = read_message(stream, &mut inbuf).await?;
            if response.status != password_method::Status::Succeeded {
                return Err(format!("SOCKS authentication failed: {:?}", response.status).into());
            }
        }
        _ => return Err("SOCKS5 server requires an unsupported authentication method.".into()),
    }

    outbuf.clear();
    protocol::Request::new(command, target).write_to_stream(&mut outbuf)?;
    stream.write_all(&outbuf).await?;

    let response: protocol::Response = read_message(stream, &mut inbuf).await?;
    if response.reply != Reply::Succeeded {
        return Err(format!("SOCKS connection failed: {}", response.reply).into());
    }
    Ok((response.address, inbuf))
}

/// Issues CONNECT for `dst`; on success `stream` carries the flow's bytes.
/// Returns any payload the server already sent after its reply.
pub async fn connect<S>(stream: &mut S, dst: SocketAddr, credentials: &Option<UserKey>) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (_, early_data) = negotiate(stream, Command::Connect, dst.into(), credentials).await?;
    Ok(early_data)
}

/// Issues UDP ASSOCIATE and returns the relay address to send datagrams to.
/// An unspecified relay IP means "same host as the proxy".
pub async fn udp_associate<S>(stream: &mut S, proxy_addr: SocketAddr, credentials: &Option<UserKey>) -> Result<SocketAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (address, _) = negotiate(stream, Command::UdpAssociate, Address::unspecified(), credentials).await?;
    let mut relay = SocketAddr::try_from(&address)?;
    if relay.ip().is_unspecified() {
        relay.set_ip(proxy_addr.ip());
    }
    log::trace!("UDP associate received address {}", relay);
    Ok(relay)
}

/// Prefixes `payload` with the SOCKS5 UDP request header for `dst`.
pub fn encode_udp_datagram(dst: SocketAddr, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let header = UdpHeader::new(0, dst.into());
    let mut datagram = Vec::with_capacity(header.len() + payload.len());
    header.write_to_stream(&mut datagram)?;
    datagram.extend_from_slice(payload);
    Ok(datagram)
}

/// Splits a relay datagram into its header and payload.
pub fn decode_udp_datagram(datagram: &[u8]) -> std::io::Result<(UdpHeader, &[u8])> {
    let header = UdpHeader::retrieve_from_stream(&mut &datagram[..])?;
    let len = header.len();
    Ok((header, &datagram[len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_header_for_ipv4() {
        let dst: SocketAddr = "8.8.4.4:53".parse().unwrap();
        let datagram = encode_udp_datagram(dst, b"query").unwrap();
        assert_eq!(&datagram[..10], &[0, 0, 0, 1, 8, 8, 4, 4, 0, 53]);
        assert_eq!(&datagram[10..], b"query");

        let (header, payload) = decode_udp_datagram(&datagram).unwrap();
        assert_eq!(header.frag, 0);
        assert_eq!(SocketAddr::try_from(&header.address).unwrap(), dst);
        assert_eq!(payload, b"query");
    }

    #[test]
    fn truncated_udp_header_is_rejected() {
        assert!(decode_udp_datagram(&[0, 0, 0, 1, 8, 8]).is_err());
    }

    #[tokio::test]
    async fn connect_handshake_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let dst: SocketAddr = "93.184.216.34:443".parse().unwrap();
        let server_task = tokio::spawn(async move {
            let mut greeting = [0_u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            server.write_all(&[5, 0]).await.unwrap();
            let mut request = [0_u8; 10];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(request, [5, 1, 0, 1, 93, 184, 216, 34, 1, 187]);
            server.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
            server.write_all(b"220 ready").await.unwrap();
        });
        let mut early = connect(&mut client, dst, &None).await.unwrap();
        while early.len() < 9 {
            let mut buf = [0_u8; 16];
            let len = client.read(&mut buf).await.unwrap();
            early.extend_from_slice(&buf[..len]);
        }
        assert_eq!(early, b"220 ready");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_connect_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut buf = [0_u8; 13];
            server.read_exact(&mut buf[..3]).await.unwrap();
            server.write_all(&[5, 0]).await.unwrap();
            server.read_exact(&mut buf[..10]).await.unwrap();
            // 0x05: connection refused
            server.write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });
        let dst: SocketAddr = "10.1.1.1:80".parse().unwrap();
        assert!(connect(&mut client, dst, &None).await.is_err());
    }

    #[tokio::test]
    async fn udp_associate_replaces_unspecified_relay_ip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut buf = [0_u8; 10];
            server.read_exact(&mut buf[..3]).await.unwrap();
            server.write_all(&[5, 0]).await.unwrap();
            server.read_exact(&mut buf[..10]).await.unwrap();
            assert_eq!(buf[1], 3);
            server.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0x1f, 0x90]).await.unwrap();
        });
        let proxy: SocketAddr = "192.0.2.1:1080".parse().unwrap();
        let relay = udp_associate(&mut client, proxy, &None).await.unwrap();
        assert_eq!(relay, "192.0.2.1:8080".parse().unwrap());
    }
}
