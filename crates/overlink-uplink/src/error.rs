//! Uplink error types
//!
//! [`UplinkError`] lives in `overlink-core`; the block codec has its own
//! error that converts into it.

pub use crate::block::BlockCodecError;
pub use overlink_core::{UplinkError, UplinkResult};
