// This module contains the client-side transfer engine.
//
// A transfer is started by sending a single read request to the server. After that the engine
// only reacts: every datagram it receives is classified and answered, and the transfer ends when
// one of the following happens:
//
// 1. A data packet shorter than a full block arrives. It is acknowledged and the transfer succeeds.
// 2. The server sends an error packet. Nothing is sent back.
// 3. Something else goes wrong (unexpected packet, socket failure, local file failure). The
//    transfer fails; where it makes sense the server is told with a courtesy error packet.
//
// The server may answer from a different port than the one the request went to, so the source
// of the first reply becomes the peer for the rest of the transfer.
//
// There is no receive timeout. A lost request or a silent server leaves the transfer waiting
// until the future is dropped.

use crate::stopwatch::Stopwatch;
use crate::tftp;
use std::error;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{self, AsyncWrite, AsyncWriteExt};

/// The number of the last block that can be told apart from its predecessors.
const LAST_BLOCK: u32 = u16::MAX as u32;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Why a transfer did not complete.
#[derive(Debug)]
pub enum TransferError {
    /// Sending or receiving on the socket failed.
    Network(io::Error),

    /// The peer sent something other than data or an error, or a packet that could not be decoded.
    Protocol(String),

    /// The peer sent an error packet.
    Server {
        code: tftp::ErrorCode,
        message: String,
    },

    /// The output sink could not be opened or written.
    LocalIo(io::Error),
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Network(e) => write!(f, "Network error: {}", e),
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Self::Server { message, .. } => write!(f, "Error from server: {}", message),
            Self::LocalIo(e) => write!(f, "Local IO error: {}", e),
        }
    }
}

impl From<tftp::SocketError> for TransferError {
    fn from(e: tftp::SocketError) -> TransferError {
        match e {
            tftp::SocketError::IO(e) => TransferError::Network(e),
            tftp::SocketError::PacketParse(msg) => TransferError::Protocol(msg),
            tftp::SocketError::Malformed(src, msg) => {
                TransferError::Protocol(format!("Malformed packet from {src}: {msg}"))
            }
            tftp::SocketError::Timeout(e) => {
                TransferError::Network(io::Error::new(io::ErrorKind::TimedOut, e))
            }
        }
    }
}

///////////////////////////////////////////////////////////////
// Output sinks

/// Opens the destination for a transfer's payload.
///
/// The engine calls `create` at most once per transfer, and only once a block worth writing has
/// arrived, so a failed request never clobbers an existing file.
#[allow(async_fn_in_trait)]
pub trait SinkFactory {
    type Sink: AsyncWrite + Unpin;

    async fn create(&mut self, local_name: &str) -> io::Result<Self::Sink>;
}

/// Writes received files into a local directory, replacing files of the same name.
#[derive(Debug, Clone)]
pub struct LocalDir {
    dir: PathBuf,
}

impl LocalDir {
    pub fn new(dir: impl Into<PathBuf>) -> LocalDir {
        LocalDir { dir: dir.into() }
    }

    /// The process's current directory.
    pub fn current() -> LocalDir {
        LocalDir::new(".")
    }
}

impl SinkFactory for LocalDir {
    type Sink = File;

    async fn create(&mut self, local_name: &str) -> io::Result<File> {
        if local_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Requested name has no file component",
            ));
        }
        let path = self.dir.join(local_name);
        log::info!("Writing to {:?}", path);
        File::create(path).await
    }
}

/// The name a remote file is stored under locally: everything after the last `/`.
pub fn local_name(filename: &str) -> &str {
    match filename.rfind('/') {
        Some(i) => &filename[i + 1..],
        None => filename,
    }
}

///////////////////////////////////////////////////////////////
// Reporting

/// What happened during one transfer.
#[derive(Debug)]
pub struct TransferReport {
    pub status: Result<(), TransferError>,

    /// Payload bytes written to the sink.
    pub byte_count: u64,

    /// Blocks written to the sink.
    pub block_count: u64,

    pub elapsed: Duration,
}

impl TransferReport {
    pub fn is_success(&self) -> bool {
        self.status.is_ok()
    }

    /// Bytes per second, or `None` if the transfer was too quick to measure.
    pub fn throughput(&self) -> Option<f64> {
        let millis = self.elapsed.as_millis();
        if millis == 0 {
            return None;
        }
        Some(self.byte_count as f64 * 1000.0 / millis as f64)
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.status {
            Ok(()) => write!(f, "Received {} bytes in {} blocks", self.byte_count, self.block_count)?,
            Err(e) => write!(f, "Transfer failed after {} bytes: {}", self.byte_count, e)?,
        }
        write!(f, "; transfer time: {:.3} seconds", self.elapsed.as_secs_f64())?;
        if let Some(rate) = self.throughput() {
            write!(f, "; transfer rate: {:.3e} bytes/s", rate)?;
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////
// The engine

/// What the receive loop decided to do after a data packet.
enum Step {
    Continue,
    Done,
}

/// State for a single read request. A session is consumed by the transfer it runs and is never
/// reused; the socket and sink are closed when it is dropped.
pub struct TransferSession<S> {
    sock: tftp::TftpSocket,

    /// Where acknowledgments go. Starts out as the server's listening address.
    peer: SocketAddr,
    pinned: bool,

    expected_next_block: u32,
    byte_count: u64,
    block_count: u64,

    sink: Option<S>,
    stopwatch: Stopwatch,
}

impl<S: AsyncWrite + Unpin> TransferSession<S> {
    pub fn new(sock: tftp::TftpSocket, server: SocketAddr) -> TransferSession<S> {
        TransferSession {
            sock,
            peer: server,
            pinned: false,
            expected_next_block: 1,
            byte_count: 0,
            block_count: 0,
            sink: None,
            stopwatch: Stopwatch::new(),
        }
    }

    /// Fetches `filename` from the server and stores it through `sinks`.
    pub async fn get_file<F>(mut self, filename: &str, sinks: &mut F) -> TransferReport
    where
        F: SinkFactory<Sink = S>,
    {
        self.stopwatch.start();
        let status = self.run(filename, sinks).await;
        self.stopwatch.stop();

        let status = match (status, self.close_sink().await) {
            (Ok(()), Err(e)) => Err(TransferError::LocalIo(e)),
            (status, _) => status,
        };

        let report = TransferReport {
            status,
            byte_count: self.byte_count,
            block_count: self.block_count,
            elapsed: self.stopwatch.elapsed(),
        };
        match &report.status {
            Ok(()) => log::info!("{filename}: {report}"),
            Err(_) => log::warn!("{filename}: {report}"),
        }
        report
    }

    async fn run<F>(&mut self, filename: &str, sinks: &mut F) -> Result<(), TransferError>
    where
        F: SinkFactory<Sink = S>,
    {
        let request = tftp::Packet::ReadReq {
            path: filename.to_string(),
            mode: tftp::FileMode::Octet,
        };
        log::info!("Requesting {:?} from {}", filename, self.peer);
        self.sock.send(&request, self.peer).await?;

        loop {
            let (packet, src) = match self.sock.recv().await {
                Ok(received) => received,
                Err(tftp::SocketError::Malformed(src, reason)) if self.is_from_peer(src) => {
                    self.pin(src);
                    let message = format!("Could not decode packet: {reason}");
                    self.send_courtesy_error(self.peer, tftp::ErrorCode::Illegal, message.clone()).await;
                    return Err(TransferError::Protocol(message));
                }
                Err(tftp::SocketError::Malformed(src, reason)) => {
                    log::warn!("Ignoring undecodable datagram from stranger {src}: {reason}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if !self.is_from_peer(src) {
                log::warn!("Got {:?} from {} while transferring with {}", packet, src, self.peer);
                self.send_courtesy_error(
                    src,
                    tftp::ErrorCode::UnknownTid,
                    "This port is in use by another transfer".to_string(),
                )
                .await;
                continue;
            }
            self.pin(src);

            match packet {
                tftp::Packet::Data { block, data } => {
                    match self.process_data(filename, block, &data, sinks).await? {
                        Step::Continue => continue,
                        Step::Done => return Ok(()),
                    }
                }
                tftp::Packet::Error { code, message } => {
                    log::warn!("Server refused {:?}: {:?} '{}'", filename, code, message);
                    return Err(TransferError::Server { code, message });
                }
                other => {
                    let message = format!("Expected to receive a Data packet, but got {:?} instead", other);
                    self.send_courtesy_error(self.peer, tftp::ErrorCode::Illegal, message.clone()).await;
                    return Err(TransferError::Protocol(message));
                }
            }
        }
    }

    /// Before pinning every source is acceptable; afterwards only the pinned one is.
    fn is_from_peer(&self, src: SocketAddr) -> bool {
        !self.pinned || src == self.peer
    }

    fn pin(&mut self, src: SocketAddr) {
        if !self.pinned {
            if src != self.peer {
                log::info!("Server answered from {}, continuing transfer there", src);
            }
            self.peer = src;
            self.pinned = true;
        }
    }

    async fn process_data<F>(
        &mut self,
        filename: &str,
        block: u16,
        data: &[u8],
        sinks: &mut F,
    ) -> Result<Step, TransferError>
    where
        F: SinkFactory<Sink = S>,
    {
        if !data.is_empty() && u32::from(block) == self.expected_next_block {
            if let Err(e) = self.write_block(filename, data, sinks).await {
                let message = format!("Client could not store block {block}: {e}");
                self.send_courtesy_error(self.peer, e.kind().into(), message).await;
                return Err(TransferError::LocalIo(e));
            }
            self.byte_count += data.len() as u64;
            self.block_count += 1;
            self.expected_next_block += 1;
            log::debug!("Received: {} bytes", self.byte_count);
        } else {
            log::debug!(
                "Not writing block {} ({} bytes), expected block {}",
                block,
                data.len(),
                self.expected_next_block
            );
        }

        // Acknowledge new blocks and duplicates alike; a duplicate means our last ack was lost.
        self.sock.send(&tftp::Packet::Ack { block }, self.peer).await?;

        if data.len() < tftp::DATA_BUFFER_SIZE {
            return Ok(Step::Done);
        }

        if self.expected_next_block > LAST_BLOCK {
            let message = format!("File exceeds {LAST_BLOCK} blocks");
            self.send_courtesy_error(self.peer, tftp::ErrorCode::DiskFull, message.clone()).await;
            return Err(TransferError::Protocol(message));
        }

        Ok(Step::Continue)
    }

    async fn write_block<F>(&mut self, filename: &str, data: &[u8], sinks: &mut F) -> io::Result<()>
    where
        F: SinkFactory<Sink = S>,
    {
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => sinks.create(local_name(filename)).await?,
        };
        self.sink.insert(sink).write_all(data).await
    }

    async fn close_sink(&mut self) -> io::Result<()> {
        match self.sink.take() {
            Some(mut sink) => {
                sink.flush().await?;
                sink.shutdown().await
            }
            None => Ok(()),
        }
    }

    async fn send_courtesy_error(&self, dst: SocketAddr, code: tftp::ErrorCode, message: String) {
        // Error packets are never acknowledged or retransmitted, so there's nothing to do if the
        // send fails.
        let _ = self.sock.send(&tftp::Packet::Error { code, message }, dst).await;
    }
}

/// Fetches one file over `sock` from the server listening at `server`.
///
/// Every failure is reported through the returned [`TransferReport`]; the caller can go straight
/// on to the next request with a fresh socket.
pub async fn transfer<F: SinkFactory>(
    filename: &str,
    sock: tftp::TftpSocket,
    server: SocketAddr,
    sinks: &mut F,
) -> TransferReport {
    TransferSession::new(sock, server).get_file(filename, sinks).await
}
