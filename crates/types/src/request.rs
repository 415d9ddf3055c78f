use alloy_primitives::{Address, Bytes};

/// A transaction request accepted by the request manager (spec.md §3).
///
/// The gateway augments these with a signer nonce and gas estimate before
/// submission (see `dg-executor`); the request itself stays a thin value
/// type describing caller intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxRequest {
    Deploy { data: Bytes, session_key: String },
    Execute {
        address: Address,
        data: Bytes,
        session_key: String,
    },
}

impl TxRequest {
    pub fn session_key(&self) -> &str {
        match self {
            Self::Deploy { session_key, .. } | Self::Execute { session_key, .. } => session_key,
        }
    }

    pub fn data(&self) -> &Bytes {
        match self {
            Self::Deploy { data, .. } | Self::Execute { data, .. } => data,
        }
    }
}
