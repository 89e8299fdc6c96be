//! nftables backend.
//!
//! Transactions are rendered as an nft script and fed to `nft -f -`, which
//! commits the whole script atomically. Existing objects are listed with
//! `nft --json`.

use std::fmt::Write as _;
use std::process::Stdio;

use async_trait::async_trait;
use svcproxy_networking::IpFamily;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{BackendError, RuleBackend};
use crate::rules::{
    Action, BaseChain, ChainType, Hook, Match, Object, ObjectKind, Op, Priority, Rule, Transaction,
};

/// Default nft binary.
pub const DEFAULT_NFT_BINARY: &str = "nft";

/// Backend driving the `nft` command for one table.
#[derive(Debug, Clone)]
pub struct NftBackend {
    family: IpFamily,
    table: String,
    binary: String,
}

impl NftBackend {
    pub fn new(family: IpFamily, table: &str) -> Self {
        Self {
            family,
            table: table.to_string(),
            binary: DEFAULT_NFT_BINARY.to_string(),
        }
    }

    /// Use a different nft binary.
    pub fn with_binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_string();
        self
    }

    /// Render a transaction as an nft script.
    pub fn render(&self, tx: &Transaction) -> String {
        let mut out = String::new();
        for op in tx.ops() {
            self.render_op(&mut out, op);
            out.push('\n');
        }
        out
    }

    fn render_op(&self, out: &mut String, op: &Op) {
        let family = self.family.nft_keyword();
        let table = &self.table;

        // Writing to a String cannot fail.
        let _ = match op {
            Op::Add(Object::Table { comment }) => write!(
                out,
                "add table {} {} {{ comment {} ; }}",
                family,
                table,
                quote(comment)
            ),
            Op::Add(Object::Chain(chain)) => match &chain.base {
                None => write!(out, "add chain {} {} {}", family, table, chain.name),
                Some(base) => write!(
                    out,
                    "add chain {} {} {} {{ {} ; }}",
                    family,
                    table,
                    chain.name,
                    render_base(base)
                ),
            },
            Op::Add(Object::Set(set)) => write!(
                out,
                "add set {} {} {} {{ type {} ; flags dynamic,timeout ; timeout {}s ; }}",
                family,
                table,
                set.name,
                if set.ipv6 { "ipv6_addr" } else { "ipv4_addr" },
                set.timeout_seconds
            ),
            Op::Add(Object::Rule(rule)) => write!(
                out,
                "add rule {} {} {} {}",
                family,
                table,
                rule.chain,
                self.render_rule(rule)
            ),
            Op::FlushChain(name) => write!(out, "flush chain {} {} {}", family, table, name),
            Op::DeleteChain(name) => write!(out, "delete chain {} {} {}", family, table, name),
            Op::DeleteSet(name) => write!(out, "delete set {} {} {}", family, table, name),
        };
    }

    fn render_rule(&self, rule: &Rule) -> String {
        let fam = self.family.nft_keyword();
        let mut parts: Vec<String> = Vec::with_capacity(rule.matches.len() + rule.actions.len() + 1);

        for m in &rule.matches {
            parts.push(match m {
                Match::DestAddr(ip) => format!("{} daddr {}", fam, ip),
                Match::SourceAddr(ip) => format!("{} saddr {}", fam, ip),
                Match::SourcePrefix(p) => format!("{} saddr {}", fam, p),
                Match::NotSourcePrefix(p) => format!("{} saddr != {}", fam, p),
                Match::DestPrefix(p) => format!("{} daddr {}", fam, p),
                Match::NotDestPrefix(p) => format!("{} daddr != {}", fam, p),
                Match::Protocol(proto) => format!("meta l4proto {}", proto),
                Match::DestPort(proto, port) => format!("{} dport {}", proto, port),
                Match::DestLocal => "fib daddr type local".to_string(),
                Match::SourceLocal => "fib saddr type local".to_string(),
                Match::CtStateNew => "ct state new".to_string(),
                Match::CtStateInvalid => "ct state invalid".to_string(),
                Match::MarkUnset(mark) => format!("mark and {:#x} == 0", mark),
                Match::Random { denominator } => {
                    format!("numgen random mod {} == 0", denominator)
                }
                Match::InAffinitySet(set) => format!("{} saddr @{}", fam, set),
            });
        }

        for a in &rule.actions {
            parts.push(match a {
                Action::Jump(chain) => format!("jump {}", chain),
                Action::Goto(chain) => format!("goto {}", chain),
                Action::Return => "return".to_string(),
                Action::Drop => "drop".to_string(),
                Action::Reject => "reject".to_string(),
                Action::MarkOr(mark) => format!("mark set mark or {:#x}", mark),
                Action::MarkXor(mark) => format!("mark set mark xor {:#x}", mark),
                Action::Masquerade => "masquerade fully-random".to_string(),
                Action::RecordAffinity(set) => format!("update @{} {{ {} saddr }}", set, fam),
                Action::Dnat(addr) => format!("dnat to {}", addr),
            });
        }

        if let Some(comment) = &rule.comment {
            parts.push(format!("comment {}", quote(comment)));
        }
        parts.join(" ")
    }

    async fn exec(&self, args: &[&str], stdin: Option<&str>) -> Result<String, BackendError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let (Some(script), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(script.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("No such file or directory") {
            Err(BackendError::NotFound(stderr))
        } else {
            Err(BackendError::Apply(stderr))
        }
    }
}

fn render_base(base: &BaseChain) -> String {
    let chain_type = match base.chain_type {
        ChainType::Filter => "filter",
        ChainType::Nat => "nat",
    };
    let hook = match base.hook {
        Hook::Prerouting => "prerouting",
        Hook::Input => "input",
        Hook::Forward => "forward",
        Hook::Output => "output",
        Hook::Postrouting => "postrouting",
    };
    let priority = match base.priority {
        Priority::Filter => "filter",
        Priority::DstNat => "dstnat",
        Priority::SrcNat => "srcnat",
    };
    format!("type {} hook {} priority {}", chain_type, hook, priority)
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "'"))
}

/// Extract object names of one table from `nft --json list ...` output.
fn parse_list(json: &str, kind: ObjectKind, table: &str) -> Result<Vec<String>, BackendError> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| BackendError::Parse(e.to_string()))?;
    let items = value
        .get("nftables")
        .and_then(|v| v.as_array())
        .ok_or_else(|| BackendError::Parse("missing nftables array".to_string()))?;

    let key = match kind {
        ObjectKind::Chains => "chain",
        ObjectKind::Sets => "set",
    };

    Ok(items
        .iter()
        .filter_map(|item| item.get(key))
        .filter(|obj| obj.get("table").and_then(|t| t.as_str()) == Some(table))
        .filter_map(|obj| obj.get("name").and_then(|n| n.as_str()))
        .map(str::to_string)
        .collect())
}

#[async_trait]
impl RuleBackend for NftBackend {
    fn name(&self) -> &'static str {
        "nftables"
    }

    async fn run(&self, tx: &Transaction) -> Result<(), BackendError> {
        if tx.is_empty() {
            return Ok(());
        }
        let script = self.render(tx);
        debug!(ops = tx.len(), bytes = script.len(), "Running nft transaction");

        self.exec(&["-f", "-"], Some(&script)).await.map(|_| ()).inspect_err(|e| {
            warn!(table = %self.table, error = %e, "nft transaction failed");
        })
    }

    async fn list(&self, kind: ObjectKind) -> Result<Vec<String>, BackendError> {
        let what = match kind {
            ObjectKind::Chains => "chains",
            ObjectKind::Sets => "sets",
        };
        let out = self
            .exec(&["--json", "list", what, self.family.nft_keyword()], None)
            .await?;
        parse_list(&out, kind, &self.table)
    }
}
