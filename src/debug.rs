//! Process-wide debug flags
//!
//! - `hpss`: log every call, response and error at debug level
//! - `hpssdetail`: also log the bytes moved through each message part
//! - `noretry`: never resend a request after a connection reset

use std::collections::BTreeSet;

use parking_lot::RwLock;

pub const HPSS: &str = "hpss";
pub const HPSS_DETAIL: &str = "hpssdetail";
pub const NO_RETRY: &str = "noretry";

static FLAGS: RwLock<BTreeSet<String>> = parking_lot::const_rwlock(BTreeSet::new());

/// Turn a flag on.
pub fn enable(flag: &str) {
    FLAGS.write().insert(flag.to_string());
}

/// Turn a flag off.
pub fn disable(flag: &str) {
    FLAGS.write().remove(flag);
}

pub fn is_enabled(flag: &str) -> bool {
    FLAGS.read().contains(flag)
}
