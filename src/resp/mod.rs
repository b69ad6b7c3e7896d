//! RESP wire protocol support.
//!
//! Only the subset the counter client needs: commands are always arrays of
//! bulk strings, and replies may be any of the five RESP2 kinds.

mod codec;

pub use codec::{encode_command, try_parse_reply, RespError, RespValue};
