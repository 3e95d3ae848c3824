use crate::config::ServerConfig;
use crate::srv_conn;
use crate::tftp;
use std::net::SocketAddr;
use std::sync::Arc;

/// Listens for requests on the well-known port and hands each one to its own task.
pub struct Server {
    sock: tftp::TftpSocket,
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn bind(config: ServerConfig) -> tftp::TftpResult<Server> {
        let sock = tftp::TftpSocket::bind(config.bind_addr)?;
        Ok(Server { sock, config: Arc::new(config) })
    }

    pub fn local_addr(&self) -> tftp::TftpResult<SocketAddr> {
        self.sock.local_addr()
    }

    /// Serves requests until the task running it is dropped.
    pub async fn run(self) {
        log::info!(
            "Serving {:?} on {}",
            self.config.root,
            self.local_addr().map(|a| a.to_string()).unwrap_or_else(|e| e.to_string())
        );

        loop {
            match self.sock.recv().await {
                Ok((packet @ tftp::Packet::ReadReq { .. }, src)) => {
                    log::info!("Got {:?} from {}", packet, src);
                    let config = Arc::clone(&self.config);
                    // A panic in here takes down only this transfer.
                    tokio::spawn(async move {
                        srv_conn::serve_request(&config, packet, src).await;
                    });
                }
                Ok((tftp::Packet::WriteReq { path, .. }, src)) => {
                    log::warn!("Refusing write of {:?} from {}", path, src);
                    self.send_error(src, tftp::ErrorCode::AccessViolation, "Writes are disabled").await;
                }
                Ok((packet, src)) => {
                    log::warn!("Ignoring {:?} from {} on the request port", packet, src);
                }
                Err(tftp::SocketError::Malformed(src, msg)) => {
                    log::warn!("Bad request from {}: {}", src, msg);
                    self.send_error(src, tftp::ErrorCode::Illegal, &msg).await;
                }
                Err(e) => {
                    log::error!("Error while receiving client request: {}", e);
                }
            }
        }
    }

    async fn send_error(&self, dst: SocketAddr, code: tftp::ErrorCode, message: &str) {
        let packet = tftp::Packet::Error { code, message: message.to_string() };
        let _ = self.sock.send(&packet, dst).await;
    }
}
