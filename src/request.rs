use crate::address;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic;

static REQUEST_UID: Lazy<atomic::AtomicU64> = Lazy::new(|| atomic::AtomicU64::new(0));

/// Generate a unique ID that can be used to identify requests in log output.
pub fn generate_uid() -> u64 {
    REQUEST_UID.fetch_add(1, atomic::Ordering::SeqCst)
}

/// A memory request produced by an upstream cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub uid: u64,
    pub address: address,
    pub v_address: address,
    pub data: u64,
    pub pf_metadata: u32,
    /// Instructions waiting on this request, by id.
    pub instr_depend_on_me: BTreeSet<u64>,
    pub asid: [u16; 2],
    /// Whether the issuer expects a completion on its `returned` queue.
    pub response_requested: bool,
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Request{}(@{:#x})", self.uid, self.address)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Builder {
    pub address: address,
    pub v_address: address,
    pub data: u64,
    pub pf_metadata: u32,
    pub instr_depend_on_me: BTreeSet<u64>,
    pub asid: [u16; 2],
    pub response_requested: bool,
}

impl Builder {
    #[must_use]
    pub fn build(self) -> Request {
        Request {
            uid: generate_uid(),
            address: self.address,
            v_address: self.v_address,
            data: self.data,
            pf_metadata: self.pf_metadata,
            instr_depend_on_me: self.instr_depend_on_me,
            asid: self.asid,
            response_requested: self.response_requested,
        }
    }
}

impl From<Builder> for Request {
    fn from(builder: Builder) -> Self {
        builder.build()
    }
}

/// The record appended to an upstream `returned` queue on completion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub address: address,
    pub v_address: address,
    pub data: u64,
    pub pf_metadata: u32,
    pub instr_depend_on_me: BTreeSet<u64>,
}

#[cfg(test)]
mod tests {
    use super::Builder;

    #[test]
    fn uids_are_unique() {
        let first = Builder {
            address: 0x1000,
            ..Builder::default()
        }
        .build();
        let second = Builder {
            address: 0x1000,
            ..Builder::default()
        }
        .build();
        assert_ne!(first.uid, second.uid);
    }
}
