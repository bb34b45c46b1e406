//! Deployment script assembly.
//!
//! Wraps a validated classifier into a bash script that installs or removes
//! an iptables rule of the form
//!
//! ```text
//! -i $DEFAULTINT -p udp --dport 53 -m set --match-set <set> dst -m bpf --bytecode "<prog>" -j DROP
//! ```
//!
//! together with the ipset it references. The install/uninstall protocol lives
//! in `templates/deploy.sh`:
//!
//! - install: `ipset -exist create`, `ipset -exist add` for each address, then
//!   insert the rule at `INPUTPLACE` only if `iptables -C` does not find it.
//! - uninstall (`--delete`): delete one copy of the rule if `iptables -C` finds
//!   it, then `ipset -exist destroy`.
//!
//! Both are safe to repeat. Concurrent installs can race between the check and
//! the insert and leave the rule in place twice; iptables offers nothing atomic
//! to prevent that.

use std::path::Path;

use askama::Template;

use crate::classifier::{self, ClassifierKind, ClassifierResult, IpFamily};
use crate::error::DnsbpfError;

/// Longest ipset name the kernel accepts (`IPSET_MAXNAMELEN` minus the NUL).
pub const MAX_SET_NAME_LEN: usize = 31;

/// Longest interface name (`IFNAMSIZ` minus the NUL).
pub const MAX_INTERFACE_LEN: usize = 15;

/// Defaults baked into the generated script. Each one can still be overridden
/// from the environment when the script runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDefaults {
    /// Interface used when no default route is found (`DEFAULTINT`).
    pub fallback_interface: String,
    /// ipset binary (`IPSET`).
    pub ipset: String,
    /// Position in the INPUT chain the rule is inserted at (`INPUTPLACE`).
    pub insert_position: u32,
}

impl Default for ScriptDefaults {
    fn default() -> Self {
        Self {
            fallback_interface: "eth0".to_string(),
            ipset: "ipset".to_string(),
            insert_position: 4,
        }
    }
}

impl ScriptDefaults {
    /// Reject values that would break out of their quoting in the script.
    pub fn validate(&self) -> Result<(), DnsbpfError> {
        validate_interface(&self.fallback_interface).map_err(DnsbpfError::InvalidParameters)?;
        validate_tool(&self.ipset).map_err(DnsbpfError::InvalidParameters)?;
        if self.insert_position == 0 {
            return Err(DnsbpfError::InvalidParameters(
                "insert position must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Check an interface name: 1 to 15 characters of `[A-Za-z0-9_.:-]`.
pub fn validate_interface(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > MAX_INTERFACE_LEN {
        return Err(format!(
            "interface name must be 1 to {MAX_INTERFACE_LEN} characters"
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b':' | b'-'))
    {
        return Err(format!("'{name}' is not a valid interface name"));
    }
    Ok(())
}

/// Check a tool name or path: `[A-Za-z0-9_./+-]`, no whitespace or quoting.
pub fn validate_tool(tool: &str) -> Result<(), String> {
    if tool.is_empty()
        || !tool
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'/' | b'+' | b'-'))
    {
        return Err(format!("'{tool}' is not a usable command name"));
    }
    Ok(())
}

/// The untruncated resource name: `bpf_<type>_ip<family>_<name>`.
pub fn resource_name(kind: ClassifierKind, family: IpFamily, classifier_name: &str) -> String {
    format!("bpf_{kind}_{family}_{classifier_name}")
}

/// The ipset name: [`resource_name`] cut to [`MAX_SET_NAME_LEN`] characters.
///
/// Names that agree on their first 31 characters map to the same set.
pub fn set_name(kind: ClassifierKind, family: IpFamily, classifier_name: &str) -> String {
    let full = resource_name(kind, family, classifier_name);
    let truncated: String = full.chars().take(MAX_SET_NAME_LEN).collect();
    if truncated.len() < full.len() {
        log::warn!("set name '{full}' truncated to '{truncated}'");
    }
    truncated
}

/// Values substituted into the script for one address family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentContext {
    pub family: IpFamily,
    /// `iptables` or `ip6tables`.
    pub iptables: &'static str,
    /// ipset `family` argument, `inet` or `inet6`.
    pub ipset_family: &'static str,
    /// Example address shown in the usage comment.
    pub sample_ips: &'static str,
    pub set_name: String,
    /// File name shown in the usage comment.
    pub file_name: String,
}

impl DeploymentContext {
    /// Derive the context for `result`. `output` is the `--write` argument,
    /// if any; `-` and `None` both show the default file name.
    pub fn new(
        kind: ClassifierKind,
        family: IpFamily,
        result: &ClassifierResult,
        output: Option<&str>,
    ) -> Self {
        let (iptables, ipset_family, sample_ips) = match family {
            IpFamily::V4 => ("iptables", "inet", "1.1.1.1/32"),
            IpFamily::V6 => ("ip6tables", "inet6", "2a00:1450:4009:803::1008/128"),
        };
        let file_name = match output {
            Some(path) if path != "-" => Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string()),
            _ => default_file_name(kind, family, &result.name),
        };
        Self {
            family,
            iptables,
            ipset_family,
            sample_ips,
            set_name: set_name(kind, family, &result.name),
            file_name,
        }
    }
}

/// File name used when none is given: the resource name plus `.sh`.
pub fn default_file_name(kind: ClassifierKind, family: IpFamily, classifier_name: &str) -> String {
    format!("{}.sh", resource_name(kind, family, classifier_name))
}

#[derive(Template)]
#[template(path = "deploy.sh", escape = "none")]
struct DeployScript<'a> {
    bpf_cmd: &'a str,
    fname: &'a str,
    sample_ips: &'a str,
    assembly: String,
    fallback_interface: &'a str,
    iptables: &'a str,
    ipset: &'a str,
    insert_position: u32,
    set_name: &'a str,
    bytecode: &'a str,
    ipset_family: &'a str,
}

/// Render the deployment script.
///
/// `result` is validated again here so that results from outside
/// [`classifier::generate`] cannot reach the template unchecked.
pub fn render(
    ctx: &DeploymentContext,
    result: &ClassifierResult,
    defaults: &ScriptDefaults,
) -> Result<String, DnsbpfError> {
    classifier::validate(result)?;
    defaults.validate()?;
    if result.command.contains('\n') || ctx.file_name.contains('\n') {
        return Err(DnsbpfError::InvalidParameters(
            "command and file name must fit on one line".to_string(),
        ));
    }

    let assembly = result
        .assembly
        .lines()
        .map(|line| format!("#    {line}"))
        .collect::<Vec<_>>()
        .join("\n");

    let script = DeployScript {
        bpf_cmd: &result.command,
        fname: &ctx.file_name,
        sample_ips: ctx.sample_ips,
        assembly,
        fallback_interface: &defaults.fallback_interface,
        iptables: ctx.iptables,
        ipset: &defaults.ipset,
        insert_position: defaults.insert_position,
        set_name: &ctx.set_name,
        bytecode: &result.bytecode,
        ipset_family: ctx.ipset_family,
    };
    let mut text = script.render()?;
    // askama drops the template's trailing newline.
    if !text.ends_with('\n') {
        text.push('\n');
    }
    log::debug!(
        "rendered {} script for set {} ({} bytes)",
        ctx.family,
        ctx.set_name,
        text.len()
    );
    Ok(text)
}

/// Everything needed to produce one script.
#[derive(Debug, Clone)]
pub struct ScriptRequest<'a> {
    pub kind: ClassifierKind,
    pub params: &'a [String],
    pub family: IpFamily,
    /// The `--write` argument, used for the usage text.
    pub output: Option<&'a str>,
    pub defaults: &'a ScriptDefaults,
}

/// A rendered script and the names it was built with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedScript {
    pub classifier: ClassifierResult,
    pub context: DeploymentContext,
    pub contents: String,
}

/// Generate, validate and render. Nothing is written; failures leave no trace.
pub fn generate(request: &ScriptRequest<'_>) -> Result<GeneratedScript, DnsbpfError> {
    let classifier = classifier::generate(request.kind, request.params, request.family)?;
    let context = DeploymentContext::new(request.kind, request.family, &classifier, request.output);
    let contents = render(&context, &classifier, request.defaults)?;
    Ok(GeneratedScript {
        classifier,
        context,
        contents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp53() -> ClassifierResult {
        ClassifierResult {
            command: "dnsbpf compile dns -- udp53".to_string(),
            bytecode: "6,40 0 0 0,21 0 3 17,40 0 0 2,21 0 1 53,6 0 0 1,6 0 0 0".to_string(),
            assembly: "(000) ldh      [0]\n(001) jeq      #0x11 jt 2 jf 5".to_string(),
            name: "udp53".to_string(),
        }
    }

    fn render_for(family: IpFamily, result: &ClassifierResult) -> String {
        let ctx = DeploymentContext::new(ClassifierKind::Dns, family, result, None);
        render(&ctx, result, &ScriptDefaults::default()).unwrap()
    }

    #[test]
    fn ipv4_context() {
        let ctx = DeploymentContext::new(ClassifierKind::Dns, IpFamily::V4, &udp53(), None);
        assert_eq!(ctx.iptables, "iptables");
        assert_eq!(ctx.ipset_family, "inet");
        assert_eq!(ctx.sample_ips, "1.1.1.1/32");
        assert_eq!(ctx.set_name, "bpf_dns_ip4_udp53");
        assert_eq!(ctx.file_name, "bpf_dns_ip4_udp53.sh");
    }

    #[test]
    fn ipv6_context() {
        let ctx = DeploymentContext::new(ClassifierKind::Dns, IpFamily::V6, &udp53(), Some("-"));
        assert_eq!(ctx.iptables, "ip6tables");
        assert_eq!(ctx.ipset_family, "inet6");
        assert_eq!(ctx.sample_ips, "2a00:1450:4009:803::1008/128");
        assert_eq!(ctx.set_name, "bpf_dns_ip6_udp53");
        assert_eq!(ctx.file_name, "bpf_dns_ip6_udp53.sh");
    }

    #[test]
    fn explicit_output_names_the_usage_text() {
        let ctx = DeploymentContext::new(
            ClassifierKind::Dns,
            IpFamily::V4,
            &udp53(),
            Some("/tmp/out/block.sh"),
        );
        assert_eq!(ctx.file_name, "block.sh");
    }

    #[test]
    fn set_name_is_truncated_to_31() {
        let name = set_name(
            ClassifierKind::Dns,
            IpFamily::V4,
            "a_very_long_domain_name_example_com",
        );
        assert_eq!(name.len(), MAX_SET_NAME_LEN);
        assert_eq!(name, "bpf_dns_ip4_a_very_long_domain_");
    }

    #[test]
    fn truncation_collides_on_shared_prefix() {
        let a = set_name(ClassifierKind::Dns, IpFamily::V4, "aaaaaaaaaaaaaaaaaaaa_one");
        let b = set_name(ClassifierKind::Dns, IpFamily::V4, "aaaaaaaaaaaaaaaaaaaa_two");
        assert_eq!(a, b);
        assert!(a.len() <= MAX_SET_NAME_LEN);
    }

    #[test]
    fn short_names_are_kept_whole() {
        assert_eq!(
            set_name(ClassifierKind::Dns, IpFamily::V6, "example_com"),
            "bpf_dns_ip6_example_com"
        );
    }

    #[test]
    fn ipv4_script_contents() {
        let script = render_for(IpFamily::V4, &udp53());
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains(": ${IPTABLES:=\"iptables\"}"));
        assert!(script.contains("hash:net family inet\n"));
        assert!(script.contains("./bpf_dns_ip4_udp53.sh 1.1.1.1/32"));
        assert!(script.contains("./bpf_dns_ip4_udp53.sh --delete"));
        assert!(script.contains("--match-set bpf_dns_ip4_udp53 dst"));
        assert!(script.contains(&format!("--bytecode \"{}\"", udp53().bytecode)));
        assert!(script.contains("#     dnsbpf compile dns -- udp53"));
        assert!(script.contains("#    (000) ldh      [0]\n#    (001) jeq"));
    }

    #[test]
    fn ipv6_script_contents() {
        let script = render_for(IpFamily::V6, &udp53());
        assert!(script.contains(": ${IPTABLES:=\"ip6tables\"}"));
        assert!(script.contains("hash:net family inet6\n"));
        assert!(script.contains("2a00:1450:4009:803::1008/128"));
        assert!(script.contains("--match-set bpf_dns_ip6_udp53 dst"));
    }

    #[test]
    fn script_runs_in_strict_mode() {
        let script = render_for(IpFamily::V4, &udp53());
        for opt in ["noclobber", "errexit", "nounset", "pipefail"] {
            assert!(script.contains(&format!("set -o {opt}\n")), "missing {opt}");
        }
    }

    #[test]
    fn script_checks_before_inserting_and_deleting() {
        let script = render_for(IpFamily::V4, &udp53());
        let check_insert = script.find("if ! iptablesrule -C INPUT").unwrap();
        let insert = script.find("iptablesrule -I INPUT ${INPUTPLACE}").unwrap();
        assert!(check_insert < insert);

        let check_delete = script.find("if iptablesrule -C INPUT").unwrap();
        let delete = script.find("iptablesrule -D INPUT").unwrap();
        let destroy = script.find("-exist destroy").unwrap();
        assert!(check_delete < delete && delete < destroy);

        assert!(script.contains("-exist create bpf_dns_ip4_udp53"));
        assert!(script.contains("-exist add bpf_dns_ip4_udp53 \"$1\""));
    }

    #[test]
    fn defaults_are_embedded() {
        let defaults = ScriptDefaults {
            fallback_interface: "ens3".to_string(),
            ipset: "/usr/sbin/ipset".to_string(),
            insert_position: 1,
        };
        let ctx = DeploymentContext::new(ClassifierKind::Dns, IpFamily::V4, &udp53(), None);
        let script = render(&ctx, &udp53(), &defaults).unwrap();
        assert!(script.contains("fallback=\"ens3\""));
        assert!(script.contains("|| echo \"ens3\""));
        assert!(script.contains(": ${IPSET:=\"/usr/sbin/ipset\"}"));
        assert!(script.contains(": ${INPUTPLACE:=\"1\"}"));
        assert!(script.contains(": ${DEFAULTINT:=$(default_interface)}"));
        assert!(script.contains("/proc/net/route"));
    }

    #[test]
    fn script_ends_with_newline() {
        let script = render_for(IpFamily::V4, &udp53());
        assert!(script.ends_with("\nfi\n"), "tail: {:?}", &script[script.len() - 8..]);
    }

    #[test]
    fn render_is_deterministic() {
        assert_eq!(
            render_for(IpFamily::V4, &udp53()),
            render_for(IpFamily::V4, &udp53())
        );
    }

    #[test]
    fn render_refuses_oversized_program() {
        let mut result = udp53();
        result.bytecode = format!("65{}", ",6 0 0 0".repeat(65));
        let ctx = DeploymentContext::new(ClassifierKind::Dns, IpFamily::V4, &result, None);
        let err = render(&ctx, &result, &ScriptDefaults::default()).unwrap_err();
        assert!(matches!(err, DnsbpfError::ProgramTooLong { count: 65, .. }));
    }

    #[test]
    fn render_refuses_unsafe_defaults() {
        let ctx = DeploymentContext::new(ClassifierKind::Dns, IpFamily::V4, &udp53(), None);
        for defaults in [
            ScriptDefaults {
                fallback_interface: "eth0\"; rm -rf /".to_string(),
                ..ScriptDefaults::default()
            },
            ScriptDefaults {
                ipset: "ip set".to_string(),
                ..ScriptDefaults::default()
            },
            ScriptDefaults {
                insert_position: 0,
                ..ScriptDefaults::default()
            },
        ] {
            assert!(render(&ctx, &udp53(), &defaults).is_err());
        }
    }

    #[test]
    fn render_refuses_multiline_command() {
        let mut result = udp53();
        result.command = "dnsbpf\nrm -rf /".to_string();
        let ctx = DeploymentContext::new(ClassifierKind::Dns, IpFamily::V4, &result, None);
        assert!(render(&ctx, &result, &ScriptDefaults::default()).is_err());
    }

    #[test]
    fn interface_validation() {
        assert!(validate_interface("eth0").is_ok());
        assert!(validate_interface("enp0s31f6").is_ok());
        assert!(validate_interface("bond0.100").is_ok());
        assert!(validate_interface("").is_err());
        assert!(validate_interface("averyveryverylongif").is_err());
        assert!(validate_interface("eth 0").is_err());
    }

    #[test]
    fn generate_builds_dns_script() {
        let params = vec!["example.com".to_string()];
        let defaults = ScriptDefaults::default();
        let generated = generate(&ScriptRequest {
            kind: ClassifierKind::Dns,
            params: &params,
            family: IpFamily::V4,
            output: None,
            defaults: &defaults,
        })
        .unwrap();
        assert_eq!(generated.context.set_name, "bpf_dns_ip4_example_com");
        assert!(generated.contents.contains(&generated.classifier.bytecode));
        assert!(!generated.contents.is_empty());
    }

    #[test]
    fn generate_rejects_invalid_parameters() {
        let params: Vec<String> = vec![];
        let defaults = ScriptDefaults::default();
        let err = generate(&ScriptRequest {
            kind: ClassifierKind::Dns,
            params: &params,
            family: IpFamily::V6,
            output: None,
            defaults: &defaults,
        })
        .unwrap_err();
        assert!(matches!(err, DnsbpfError::InvalidParameters(_)));
    }
}
