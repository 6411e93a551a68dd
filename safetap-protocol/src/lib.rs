/// Protocol definitions between the SafeTap client and the development relay
///
/// Every frame is a single line of the form:
///
/// ```ignore
/// <verb> [<b64 encoded argument>...]
/// ```
///
/// Where `verb` is a simple ASCII string such as `append` or `snapshot`.
/// Requests carry a client chosen reference that the relay echoes back so
/// replies can be matched to the request that caused them.
use thiserror::Error;

mod codec;
mod model;
mod util;

pub use codec::{ClientFrame, ClientFrameCodec, ServerFrame, ServerFrameCodec};
pub use model::{Entry, Posted, MAX_NAME_LEN, MAX_TEXT_LEN};

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("lines parse error: {0}")]
    LinesParseError(#[from] tokio_util::codec::LinesCodecError),

    #[error("invalid frame")]
    InvalidFrame,
}
