//! Protocol Module
//!
//! RESP wire framing.
//!
//! ## Request forms
//!
//! ```text
//! multi-bulk:  *<argc>\r\n  then per argument  $<len>\r\n<bytes>\r\n
//! inline:      CMD arg arg\r\n
//! ```
//!
//! ## Reply forms
//!
//! ```text
//! +<line>\r\n          simple string
//! -ERR <message>\r\n   error
//! :<n>\r\n             integer
//! $<n>\r\n<bytes>\r\n  bulk   ($-1\r\n = nil)
//! *<n>\r\n<reply>*     multi-bulk   (*-1\r\n = nil array)
//! ```
//!
//! Streamed multi-bulk replies write the element count up front, then
//! each element as it is pulled from the producing iterator.

mod codec;

pub use codec::{encode_argv, read_argv, read_resp_value, write_reply, RespValue};
