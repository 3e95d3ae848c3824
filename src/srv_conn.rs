// This module contains the server-side request handler.
//
// A handler is created for every read request that arrives on the listening port. It works in
// roughly the following stages:
//
// 1. Bind a fresh socket on a random port. Everything the client hears about this request,
//    including refusals, comes from that port.
// 2. Work out which file the client wants and whether it may have it. If not, send a single error
//    packet and stop.
// 3. Send the file block by block. Each block is sent and then the handler waits for the client
//    to acknowledge it. If no acknowledgment arrives in time, the block is sent again, up to a
//    configured number of times.
// 4. Once the short final block is acknowledged, or an error packet is sent or received, the
//    handler is done and its socket is closed.
//
// Handlers share nothing with each other, so a misbehaving client can only ever end its own
// transfer.

use crate::config::ServerConfig;
use crate::processor::{ReadProcessor, ResultAction};
use crate::tftp;
use rand::Rng;
use std::error;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io;
use tokio::time::Instant;

const BIND_ATTEMPTS: usize = 32;

/// An object responsible for handling a request.
pub struct ServerRequestHandler {
    /// The TFTP socket used to send and receive packets for this request.
    sock: tftp::TftpSocket,

    /// The address to send packets to.
    dst: SocketAddr,

    /// The packet processor.
    processor: ReadProcessor,

    /// How long to wait for an acknowledgment before resending.
    timeout: Duration,

    /// How many times in a row a block may be resent.
    max_retries: u8,
}

/// What happened while waiting for the client to answer the last packet.
enum Wait {
    Reply(tftp::Packet),
    TimedOut,
    Finished,
}

/// Attempts to bind to a random UDP port in `ports` until one succeeds.
fn bind_random_socket(ip: IpAddr, ports: &Range<u16>) -> tftp::TftpResult<tftp::TftpSocket> {
    if ports.is_empty() {
        return Err(tftp::SocketError::IO(io::Error::new(io::ErrorKind::InvalidInput, "Empty port range")));
    }
    let mut rng = rand::thread_rng();
    let mut last_err = None;
    for _ in 0..BIND_ATTEMPTS {
        match tftp::TftpSocket::bind((ip, rng.gen_range(ports.clone())).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                log::warn!("Couldn't bind socket: {}", e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        tftp::SocketError::IO(io::Error::new(io::ErrorKind::AddrInUse, "No port available"))
    }))
}

async fn send_error_packet(
    sock: &tftp::TftpSocket,
    dst: SocketAddr,
    code: tftp::ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&tftp::Packet::Error { code, message }, dst).await;
}

/// Maps a requested name onto a file below `root`.
///
/// Leading slashes are dropped so absolute-looking names are served from the root. Names that
/// would leave the root are refused.
pub fn resolve_path(root: &Path, requested: &str) -> Result<PathBuf, ServerConnectionError> {
    let relative = Path::new(requested.trim_start_matches('/'));
    if relative.as_os_str().is_empty() {
        return Err(ServerConnectionError::BadRequest("No file name given".to_string()));
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ServerConnectionError::BadRequest(format!(
                    "'{requested}' points outside the served directory"
                )))
            }
        }
    }
    Ok(root.join(relative))
}

fn open_failure_message(e: &io::Error) -> String {
    match e.kind() {
        io::ErrorKind::NotFound => "File not found".to_string(),
        io::ErrorKind::PermissionDenied => "Access violation".to_string(),
        _ => format!("Could not open file: {}", e),
    }
}

impl ServerRequestHandler {
    /// Sets up the transfer for `initial_request`, or tells the client why there won't be one.
    pub async fn new(
        config: &ServerConfig,
        initial_request: &tftp::Packet,
        src: SocketAddr,
    ) -> Result<ServerRequestHandler, ServerConnectionError> {
        log::info!("Binding socket");
        let sock = bind_random_socket(config.bind_addr.ip(), &config.port_range)?;

        let (path, mode) = match initial_request {
            tftp::Packet::ReadReq { path, mode } => (path, mode),
            _ => {
                send_error_packet(
                    &sock,
                    src,
                    tftp::ErrorCode::Illegal,
                    "Only read requests are accepted".to_string(),
                )
                .await;
                return Err(ServerConnectionError::BadRequest(
                    "Only read requests are valid initial requests.".to_string(),
                ));
            }
        };

        if *mode == tftp::FileMode::Mail {
            send_error_packet(
                &sock,
                src,
                tftp::ErrorCode::Undefined,
                "Support for mail mode is unimplemented".to_string(),
            )
            .await;
            return Err(ServerConnectionError::BadRequest(
                "Peer requested mail mode, which is unsupported".to_string(),
            ));
        }

        let open_path = match resolve_path(&config.root, path) {
            Ok(p) => p,
            Err(e) => {
                send_error_packet(&sock, src, tftp::ErrorCode::AccessViolation, "Access violation".to_string()).await;
                return Err(e);
            }
        };

        let processor = match ReadProcessor::open(&open_path).await {
            Ok(p) => p,
            Err(e) => {
                send_error_packet(&sock, src, e.kind().into(), open_failure_message(&e)).await;
                return Err(e.into());
            }
        };

        Ok(ServerRequestHandler {
            sock,
            dst: src,
            processor,
            timeout: config.timeout,
            max_retries: config.max_retries,
        })
    }

    /// Does the work of sending and receiving data over the connection until the connection closes
    pub async fn handle(&mut self) {
        let mut out_packet = match self.processor.first_packet().await {
            ResultAction::SendPacketAndAwait(p) => p,
            ResultAction::TerminateWithPacket(p) => {
                log::warn!("Terminating request to {} and sending packet {:?}", self.dst, p);
                let _ = self.sock.send(&p, self.dst).await;
                return;
            }
            ResultAction::CloseConnection(_) | ResultAction::RetryRecv => {
                log::error!("Packet processor had nothing to send for the first block");
                send_error_packet(
                    &self.sock,
                    self.dst,
                    tftp::ErrorCode::Undefined,
                    "Internal error, please retry".to_string(),
                )
                .await;
                return;
            }
        };

        let mut retries = 0;
        loop {
            if let Err(e) = self.sock.send(&out_packet, self.dst).await {
                log::warn!("Unable to send packet: {e}");
                return;
            }

            match self.await_reply().await {
                Wait::Reply(p) => {
                    out_packet = p;
                    retries = 0;
                }
                Wait::TimedOut if retries < self.max_retries => {
                    retries += 1;
                    log::info!("Timed out waiting for {}, resending (attempt {})", self.dst, retries);
                }
                Wait::TimedOut => {
                    log::warn!("Giving up on {} after {} resends", self.dst, retries);
                    send_error_packet(
                        &self.sock,
                        self.dst,
                        tftp::ErrorCode::Undefined,
                        "Timed out waiting for acknowledgment".to_string(),
                    )
                    .await;
                    return;
                }
                Wait::Finished => {
                    log::info!("Closing connection with {}", self.dst);
                    return;
                }
            }
        }
    }

    /// Waits for the client to answer the packet just sent.
    async fn await_reply(&mut self) -> Wait {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Wait::TimedOut;
            }

            match self.sock.recv_with_timeout(remaining).await {
                Ok((packet, src)) => {
                    log::debug!("Got packet from {}: {:?}", src, packet);
                    // First, check whether the data came from the src we were expecting.
                    if src != self.dst {
                        send_error_packet(
                            &self.sock,
                            src,
                            tftp::ErrorCode::UnknownTid,
                            "This connection has already been initiated with a different client, cannot send packets over this socket.".to_string(),
                        )
                        .await;
                        continue;
                    }

                    match self.processor.process_packet(&packet).await {
                        ResultAction::SendPacketAndAwait(p) => return Wait::Reply(p),
                        ResultAction::RetryRecv => continue,
                        ResultAction::CloseConnection(maybe_warn) => {
                            if let Some(msg) = maybe_warn {
                                log::warn!("{}", msg);
                            }
                            return Wait::Finished;
                        }
                        ResultAction::TerminateWithPacket(p) => {
                            let _ = self.sock.send(&p, src).await;
                            return Wait::Finished;
                        }
                    }
                }
                Err(tftp::SocketError::Timeout(_)) => return Wait::TimedOut,
                Err(tftp::SocketError::Malformed(src, msg)) if src != self.dst => {
                    log::warn!("Ignoring undecodable datagram from {}: {}", src, msg);
                }
                // If we couldn't parse the incoming packet, send an error and kill the connection.
                Err(tftp::SocketError::Malformed(_, msg)) | Err(tftp::SocketError::PacketParse(msg)) => {
                    send_error_packet(
                        &self.sock,
                        self.dst,
                        tftp::ErrorCode::Illegal,
                        format!("Error parsing incoming packet: {msg}"),
                    )
                    .await;
                    return Wait::Finished;
                }
                // If we had an I/O error involving the socket, send an error and kill the
                // connection.
                Err(tftp::SocketError::IO(e)) => {
                    send_error_packet(
                        &self.sock,
                        self.dst,
                        tftp::ErrorCode::Undefined,
                        format!("I/O error: {}", e),
                    )
                    .await;
                    return Wait::Finished;
                }
            }
        }
    }
}

/// Runs one request from start to finish. Failures are logged and go no further.
pub async fn serve_request(config: &ServerConfig, request: tftp::Packet, client: SocketAddr) {
    match ServerRequestHandler::new(config, &request, client).await {
        Ok(mut handler) => handler.handle().await,
        Err(e) => log::warn!("Refused {:?} from {}: {}", request, client, e),
    }
}

#[derive(Debug)]
pub enum ServerConnectionError {
    BadRequest(String),
    File(io::Error),
    Socket(tftp::SocketError),
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::File(e) => write!(f, "File IO error: {}", e),
            Self::Socket(e) => write!(f, "Socket error: {}", e),
        }
    }
}

impl From<io::Error> for ServerConnectionError {
    fn from(e: io::Error) -> ServerConnectionError {
        ServerConnectionError::File(e)
    }
}

impl From<tftp::SocketError> for ServerConnectionError {
    fn from(e: tftp::SocketError) -> ServerConnectionError {
        ServerConnectionError::Socket(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempdir::TempDir;
    use tokio_test::assert_err;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(root: &Path) -> ServerConfig {
        ServerConfig {
            bind_addr: (Ipv4Addr::LOCALHOST, 0).into(),
            root: root.to_path_buf(),
            timeout: Duration::from_millis(100),
            max_retries: 2,
            ..ServerConfig::default()
        }
    }

    fn client_socket() -> tftp::TftpSocket {
        tftp::TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap()
    }

    fn read_req(path: &str) -> tftp::Packet {
        tftp::Packet::ReadReq { path: path.to_string(), mode: tftp::FileMode::Octet }
    }

    #[test]
    fn test_resolve_path() {
        let root = Path::new("/srv/tftp");
        assert_eq!(resolve_path(root, "boot/kernel").unwrap(), root.join("boot/kernel"));
        assert_eq!(resolve_path(root, "/boot/kernel").unwrap(), root.join("boot/kernel"));
        assert_eq!(resolve_path(root, "./a.txt").unwrap(), root.join("./a.txt"));
        assert_err!(resolve_path(root, ""));
        assert_err!(resolve_path(root, "/"));
        assert_err!(resolve_path(root, "../etc/passwd"));
        assert_err!(resolve_path(root, "boot/../../etc/passwd"));
    }

    #[tokio::test]
    async fn test_missing_file_is_refused_from_new_port() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let config = test_config(tmpdir.path());
        let client = client_socket();
        let client_addr = client.local_addr().unwrap();

        let result = ServerRequestHandler::new(&config, &read_req("nope.txt"), client_addr).await;
        assert!(matches!(result, Err(ServerConnectionError::File(_))));

        let (reply, src) = client.recv_with_timeout(WAIT).await.unwrap();
        assert_eq!(
            reply,
            tftp::Packet::Error { code: tftp::ErrorCode::FileNotFound, message: "File not found".to_string() }
        );
        assert!(config.port_range.contains(&src.port()));
    }

    #[tokio::test]
    async fn test_traversal_is_refused() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let config = test_config(&tmpdir.path().join("root"));
        std::fs::create_dir(&config.root).unwrap();
        std::fs::write(tmpdir.path().join("secret.txt"), b"secret").unwrap();
        let client = client_socket();

        let result = ServerRequestHandler::new(&config, &read_req("../secret.txt"), client.local_addr().unwrap()).await;
        assert!(matches!(result, Err(ServerConnectionError::BadRequest(_))));

        let (reply, _) = client.recv_with_timeout(WAIT).await.unwrap();
        assert!(matches!(reply, tftp::Packet::Error { code: tftp::ErrorCode::AccessViolation, .. }));
    }

    #[tokio::test]
    async fn test_mail_mode_is_refused() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let config = test_config(tmpdir.path());
        let client = client_socket();
        let request = tftp::Packet::ReadReq { path: "a.txt".to_string(), mode: tftp::FileMode::Mail };

        assert!(ServerRequestHandler::new(&config, &request, client.local_addr().unwrap()).await.is_err());
        let (reply, _) = client.recv_with_timeout(WAIT).await.unwrap();
        assert!(matches!(reply, tftp::Packet::Error { code: tftp::ErrorCode::Undefined, .. }));
    }

    #[tokio::test]
    async fn test_sends_file_and_resends_on_timeout() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let config = test_config(tmpdir.path());
        let mut contents = vec![b'q'; 512];
        contents.extend_from_slice(b"tail");
        std::fs::write(tmpdir.path().join("file.bin"), &contents).unwrap();

        let client = client_socket();
        let client_addr = client.local_addr().unwrap();
        let server = tokio::spawn(async move {
            serve_request(&config, read_req("/file.bin"), client_addr).await;
        });

        let (first, server_addr) = client.recv_with_timeout(WAIT).await.unwrap();
        assert_eq!(first, tftp::Packet::Data { block: 1, data: vec![b'q'; 512] });

        // Say nothing; the block should come again.
        let (again, _) = client.recv_with_timeout(WAIT).await.unwrap();
        assert_eq!(again, first);

        client.send(&tftp::Packet::Ack { block: 1 }, server_addr).await.unwrap();
        let (second, _) = client.recv_with_timeout(WAIT).await.unwrap();
        assert_eq!(second, tftp::Packet::Data { block: 2, data: b"tail".to_vec() });

        client.send(&tftp::Packet::Ack { block: 2 }, server_addr).await.unwrap();
        tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let config = test_config(tmpdir.path());
        std::fs::write(tmpdir.path().join("file.bin"), b"hello").unwrap();

        let client = client_socket();
        let client_addr = client.local_addr().unwrap();
        let server = tokio::spawn(async move {
            serve_request(&config, read_req("file.bin"), client_addr).await;
        });

        // The first send plus two resends, then an error.
        for _ in 0..3 {
            let (packet, _) = client.recv_with_timeout(WAIT).await.unwrap();
            assert_eq!(packet, tftp::Packet::Data { block: 1, data: b"hello".to_vec() });
        }
        let (packet, _) = client.recv_with_timeout(WAIT).await.unwrap();
        assert!(matches!(packet, tftp::Packet::Error { code: tftp::ErrorCode::Undefined, .. }));
        tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stranger_gets_unknown_tid() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let mut config = test_config(tmpdir.path());
        config.timeout = Duration::from_secs(2);
        std::fs::write(tmpdir.path().join("file.bin"), b"hello").unwrap();

        let client = client_socket();
        let stranger = client_socket();
        let client_addr = client.local_addr().unwrap();
        let server = tokio::spawn(async move {
            serve_request(&config, read_req("file.bin"), client_addr).await;
        });

        let (_, server_addr) = client.recv_with_timeout(WAIT).await.unwrap();
        stranger.send(&tftp::Packet::Ack { block: 1 }, server_addr).await.unwrap();
        let (reply, _) = stranger.recv_with_timeout(WAIT).await.unwrap();
        assert!(matches!(reply, tftp::Packet::Error { code: tftp::ErrorCode::UnknownTid, .. }));

        client.send(&tftp::Packet::Ack { block: 1 }, server_addr).await.unwrap();
        tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    }
}
