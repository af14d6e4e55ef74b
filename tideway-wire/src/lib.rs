// The wire layer: a command-frame codec over a single bidirectional
// byte stream.
//
// Each frame is: version byte, command byte, uleb128 payload length,
// payload, 20-byte HMAC-SHA1 of the payload. MACs are chained: every
// MAC is computed over the previous frame's MAC followed by this
// frame's payload, so reordering, truncation or replay of otherwise
// well-formed frames is detected by the very next read. Any decode or
// MAC failure means the stream can no longer be trusted and the
// session must unwind.
//
// Incoming bytes accumulate in a ByteQueue until a complete frame is
// present; nothing is consumed or MAC-chained for partial frames.

mod cmd;
mod hmac;
mod ioq;
mod netio;

pub use cmd::{Netcmd, MAX_PAYLOAD_LEN, PROTOCOL_VERSION};
pub use hmac::{ChainedHmac, MAC_LEN};
pub use ioq::ByteQueue;
pub use netio::{
    extract_bytes, extract_id, extract_len_prefixed, extract_u8, extract_uleb128,
    extract_utf8_prefixed, require_bytes, require_end, write_len_prefixed, write_uleb128,
    BadDecode, DecodeResult,
};
