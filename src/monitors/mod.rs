//! Host health probes

pub mod probe;
