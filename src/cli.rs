use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::classifier::{ClassifierKind, IpFamily};
use crate::script::{self, ScriptDefaults};

#[derive(Parser, Debug)]
#[command(
    name = "dnsbpf",
    version,
    about = "Generate iptables scripts that drop DNS queries matching an xt_bpf classifier"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Generate a script that inserts (or, with --delete, removes) the blocking rule
    Script(ScriptArgs),
    /// Print the classifier program on its own
    Compile(CompileArgs),
}

/// Classifier selection shared by all subcommands.
///
/// Options must come before the classifier type: everything after it is
/// handed to the generator.
#[derive(Args, Debug, Clone)]
pub struct ClassifierArgs {
    #[arg(short = '4', long = "inet4", hide = true, conflicts_with = "inet6")]
    pub inet4: bool,

    /// Generate for IPv6
    #[arg(short = '6', long = "inet6")]
    pub inet6: bool,

    /// BPF generator type
    #[arg(value_enum, value_name = "TYPE")]
    pub kind: ClassifierKind,

    /// Parameters for the BPF generator; everything after TYPE, flags included
    #[arg(
        value_name = "PARAMS",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub params: Vec<String>,
}

impl ClassifierArgs {
    pub fn family(&self) -> IpFamily {
        if self.inet6 {
            IpFamily::V6
        } else {
            IpFamily::V4
        }
    }
}

/// Arguments of the `script` subcommand.
#[derive(Args, Debug, Clone)]
pub struct ScriptArgs {
    /// Name the generated script ("-" writes to stdout) [default: bpf_<type>_ip<family>_<name>.sh]
    #[arg(short = 'w', long = "write", value_name = "FILE", value_parser = validate_output)]
    pub write: Option<String>,

    /// Interface the script uses when it cannot find the default route
    #[arg(long, default_value = "eth0", value_parser = validate_interface)]
    pub fallback_interface: String,

    /// ipset command the script runs
    #[arg(long, default_value = "ipset", value_parser = validate_tool)]
    pub ipset: String,

    /// Position in the INPUT chain the rule is inserted at
    #[arg(long, default_value_t = 4, value_parser = validate_insert_position)]
    pub insert_position: u32,

    #[command(flatten)]
    pub classifier: ClassifierArgs,
}

impl ScriptArgs {
    pub fn defaults(&self) -> ScriptDefaults {
        ScriptDefaults {
            fallback_interface: self.fallback_interface.clone(),
            ipset: self.ipset.clone(),
            insert_position: self.insert_position,
        }
    }
}

/// Arguments of the `compile` subcommand.
#[derive(Args, Debug, Clone)]
pub struct CompileArgs {
    /// Output format
    #[arg(long, default_value = "bytecode")]
    pub format: OutputFormat,

    #[command(flatten)]
    pub classifier: ClassifierArgs,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Bytecode,
    Assembly,
    Json,
}

fn validate_output(s: &str) -> Result<String, String> {
    if s.is_empty() {
        Err("output file name must not be empty".to_string())
    } else if s.chars().any(char::is_control) {
        Err("output file name must not contain control characters".to_string())
    } else {
        Ok(s.to_string())
    }
}

fn validate_interface(s: &str) -> Result<String, String> {
    script::validate_interface(s).map(|()| s.to_string())
}

fn validate_tool(s: &str) -> Result<String, String> {
    script::validate_tool(s).map(|()| s.to_string())
}

fn validate_insert_position(s: &str) -> Result<u32, String> {
    let val: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val == 0 {
        Err("insert position must be at least 1".to_string())
    } else if val > 65535 {
        Err("insert position must be at most 65535".to_string())
    } else {
        Ok(val)
    }
}
