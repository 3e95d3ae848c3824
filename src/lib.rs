// A small TFTP (RFC 1350) implementation that only reads files.
//
// Packets:
//
// opcode   operation
// 1        Read req (RRQ)      0x01 | Filename | 0x00 | Mode | 0x00
// 2        Write req (WRQ)     refused by the server, never sent
// 3        Data (DATA)         0x03 | Block # (2 bytes) | Data (0-512 bytes)
// 4        ACK                 0x04 | Block # (2 bytes)
// 5        ERROR               0x05 | ErrorCode (2 bytes) | ErrMsg | 0x00
//
// The client sends one read request to the server's well-known port. The server answers from a
// port of its own with block 1, and from then on every block is acknowledged before the next one
// is sent. A block shorter than 512 bytes ends the transfer. Error packets end it too; they are
// never acknowledged or retransmitted.
//
// Block numbers are 16 bits wide and are not allowed to wrap, which caps a transfer at 65535
// blocks (a little under 32 MiB). Both sides refuse to go past that rather than wrap.

pub mod client;
pub mod config;
pub mod processor;
pub mod server;
pub mod srv_conn;
pub mod stopwatch;
pub mod tftp;
