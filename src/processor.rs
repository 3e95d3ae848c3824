use crate::tftp;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt};

/// Represents an action that the caller of ReadProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should close the connection without sending a message, optionally logging a string.
    CloseConnection(Option<String>),

    /// Caller should go back to waiting without sending anything.
    RetryRecv,

    /// Caller should terminate the connection by sending the packet.
    TerminateWithPacket(tftp::Packet),
}

/// Drives the sending side of a read request: every acknowledgment of the current block is
/// answered with the next block of the file.
#[derive(Debug)]
pub struct ReadProcessor {
    f: File,
    curr_block: u16,
    awaiting_final_ack: bool,
}

impl ReadProcessor {
    pub async fn open(path: &Path) -> Result<ReadProcessor, io::Error> {
        log::info!("Reading from {:?}", path);
        let f = File::open(path).await?;
        if f.metadata().await?.is_dir() {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("{:?} is a directory", path)));
        }
        Ok(ReadProcessor::new(f))
    }

    fn new(f: File) -> ReadProcessor {
        ReadProcessor {
            f,
            curr_block: 0,
            awaiting_final_ack: false,
        }
    }

    /// Produces block 1, as if the client had acknowledged an imaginary block 0.
    pub async fn first_packet(&mut self) -> ResultAction {
        self.process_packet(&tftp::Packet::Ack { block: 0 }).await
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            &tftp::Packet::Ack { block } if block == self.curr_block => {
                if self.awaiting_final_ack {
                    return ResultAction::CloseConnection(None);
                }
                if self.curr_block == u16::MAX {
                    return ResultAction::TerminateWithPacket(tftp::Packet::Error {
                        code: tftp::ErrorCode::DiskFull,
                        message: format!("File exceeds {} blocks", u16::MAX),
                    });
                }
                match read_block_from_file(&mut self.f).await {
                    Ok(data) => {
                        self.curr_block += 1;
                        if data.len() < tftp::DATA_BUFFER_SIZE {
                            self.awaiting_final_ack = true;
                        }
                        ResultAction::SendPacketAndAwait(tftp::Packet::Data { block: self.curr_block, data })
                    }
                    Err(e) => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                        code: e.kind().into(),
                        message: format!("Failed to read from file: {}", e),
                    }),
                }
            }
            // Ignore acks for blocks we know have already been acknowledged. Answering them would
            // duplicate every following block.
            &tftp::Packet::Ack { block } if block < self.curr_block => ResultAction::RetryRecv,
            &tftp::Packet::Ack { block } => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                code: tftp::ErrorCode::Illegal,
                message: format!(
                    "Cannot acknowledge a block which was not yet sent. Server's current block is {cb}, but received an ack for {block}",
                    cb = self.curr_block
                ),
            }),
            tftp::Packet::Error { code, message } => ResultAction::CloseConnection(Some(format!(
                "Client sent error packet: code: {:?}, message: '{}'",
                code, message
            ))),
            _ => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                code: tftp::ErrorCode::Illegal,
                message: format!("Expected to receive an Ack packet, but got {:?} instead", packet),
            }),
        }
    }
}

async fn read_block_from_file(f: &mut File) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; tftp::DATA_BUFFER_SIZE];
    let mut filled = 0;

    // A single read may come back short without being at the end of the file, so keep reading
    // until the block is full or the file runs out.
    while filled < buf.len() {
        match f.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    buf.truncate(filled);
    Ok(buf)
}
