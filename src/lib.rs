//! Generate shell scripts that install an iptables rule dropping DNS queries
//! which match an xt_bpf classifier and are sent to addresses in an ipset.

pub mod bpf;
pub mod classifier;
pub mod cli;
pub mod error;
pub mod output;
pub mod script;
