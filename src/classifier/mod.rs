//! Classifier generators and the validation gate their output must pass.
//!
//! A generator turns user parameters into a classic BPF program for the
//! iptables `bpf` match. Every generated [`ClassifierResult`] goes through
//! [`validate`] before anything is rendered or written.

pub mod dns;

use std::fmt;

use clap::ValueEnum;
use serde::Serialize;

use crate::bpf::{self, XT_BPF_MAX_NUM_INSTR};
use crate::error::DnsbpfError;

/// Name of the binary, used when recording how a classifier was produced.
pub const PROGRAM_NAME: &str = "dnsbpf";

/// xt_bpf runs the program with packet data starting at the network header.
pub const L3_OFFSET: u32 = 0;

/// Address family a classifier and its script are generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// The IP version number, 4 or 6.
    pub fn version(self) -> u8 {
        match self {
            IpFamily::V4 => 4,
            IpFamily::V6 => 6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ip{}", self.version())
    }
}

/// Supported classifier generators.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassifierKind {
    /// Match DNS queries by question name
    Dns,
}

impl ClassifierKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ClassifierKind::Dns => "dns",
        }
    }

    /// The generator implementing this classifier type.
    pub fn generator(self) -> Box<dyn Classifier> {
        match self {
            ClassifierKind::Dns => Box::new(dns::DnsClassifier),
        }
    }
}

impl fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generated classifier program together with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifierResult {
    /// Command line that reproduces this program.
    pub command: String,
    /// xt_bpf bytecode, `N,code jt jf k,...`.
    pub bytecode: String,
    /// Disassembly of `bytecode`, for humans only.
    pub assembly: String,
    /// Short identifier of this variant, safe for file and set names.
    pub name: String,
}

/// A generator of classifier programs.
pub trait Classifier {
    fn kind(&self) -> ClassifierKind;

    /// Build a program from `params` for packets of `family` whose network
    /// header starts `l3_offset` bytes into the data the program sees.
    ///
    /// Fails with [`DnsbpfError::InvalidParameters`] when `params` do not
    /// describe a valid classifier of this type.
    fn generate(
        &self,
        params: &[String],
        family: IpFamily,
        l3_offset: u32,
    ) -> Result<ClassifierResult, DnsbpfError>;
}

/// Run the generator for `kind` and check its output against xt_bpf limits.
pub fn generate(
    kind: ClassifierKind,
    params: &[String],
    family: IpFamily,
) -> Result<ClassifierResult, DnsbpfError> {
    let result = kind.generator().generate(params, family, L3_OFFSET)?;
    let count = validate(&result)?;
    log::debug!(
        "{kind} classifier '{}' for {family}: {count} instructions",
        result.name
    );
    Ok(result)
}

/// Check that `result` carries a program xt_bpf will load.
///
/// Returns the instruction count. A count above [`XT_BPF_MAX_NUM_INSTR`] is a
/// hard failure: iptables would refuse the rule at load time.
pub fn validate(result: &ClassifierResult) -> Result<usize, DnsbpfError> {
    let count = bpf::declared_len(&result.bytecode)?;
    if count > XT_BPF_MAX_NUM_INSTR {
        return Err(DnsbpfError::ProgramTooLong {
            count,
            max: XT_BPF_MAX_NUM_INSTR,
        });
    }
    bpf::parse_bytecode(&result.bytecode)?;
    if result.name.is_empty() {
        return Err(DnsbpfError::InvalidParameters(
            "classifier produced an empty name".to_string(),
        ));
    }
    Ok(count)
}

/// Shell-quoted `compile` invocation reproducing a classifier.
pub fn command_line(
    kind: ClassifierKind,
    family: IpFamily,
    params: &[String],
) -> Result<String, DnsbpfError> {
    let mut words = vec![PROGRAM_NAME, "compile"];
    if family == IpFamily::V6 {
        words.push("-6");
    }
    words.push(kind.as_str());
    words.push("--");
    words.extend(params.iter().map(String::as_str));
    shlex::try_join(words).map_err(|e| DnsbpfError::InvalidParameters(e.to_string()))
}
