//! Error taxonomy of the client

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// TCP connect to the usbipd server failed
    #[error("connection to {addr} refused: {source}")]
    ConnectionRefused {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The socket closed mid-operation; faults every suspended caller
    #[error("connection to the usbipd server lost")]
    Disconnected,

    /// An op or command header failed a length, version or code check
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Buffer ended before the configuration descriptor's declared length
    #[error("truncated configuration descriptor: declared {declared} bytes, got {actual}")]
    TruncatedDescriptor { declared: usize, actual: usize },

    /// A descriptor record shorter than its own header
    #[error("malformed descriptor record at offset {offset}")]
    MalformedDescriptor { offset: usize },

    /// The device declares no bulk IN/OUT endpoint pair
    #[error("device is not a CDC serial device: no bulk endpoint pair")]
    NotCdcSerial,

    /// OP_REP_IMPORT came back with a nonzero status
    #[error("attach to {busid} failed with status {status}")]
    AttachFailed { busid: String, status: i32 },

    /// Write to the server socket errored
    #[error("send to the usbipd server failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// A read deadline elapsed before the requested data arrived
    #[error("timed out waiting for response data")]
    ReadTimeout,

    /// The transaction was cancelled with CMD_UNLINK
    #[error("transaction was unlinked")]
    Unlinked,

    /// RET_SUBMIT carried a nonzero status for this URB
    #[error("urb completed with status {status}")]
    UrbFailed { status: i32 },

    /// The 32-bit seqnum counter is used up; the connection must be closed
    #[error("sequence numbers exhausted for this connection")]
    SeqnumExhausted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
