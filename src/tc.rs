use log::{debug, error};
use std::net::Ipv4Addr;
use std::process::Command;

/// Runs a `tc` invocation and returns its stdout. Implementations must not
/// fail loudly: an empty string stands in for any output that could not be
/// produced, and higher layers proceed best-effort.
pub trait TcRunner: Send {
    fn run(&mut self, args: &[String]) -> String;
}

/// Production runner spawning the tc binary.
pub struct SubprocessRunner;

impl TcRunner for SubprocessRunner {
    fn run(&mut self, args: &[String]) -> String {
        match Command::new("tc").args(args).output() {
            Ok(output) => {
                if !output.status.success() {
                    // Deletes against empty state fail routinely, keep quiet
                    debug!(
                        "tc {} exited with {}: {}",
                        args.join(" "),
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            Err(e) => {
                error!("Failed to run tc {}: {}", args.join(" "), e);
                String::new()
            }
        }
    }
}

/// Issues typed TC operations against a single network interface.
pub struct TcDriver {
    dev: String,
    runner: Box<dyn TcRunner>,
}

impl TcDriver {
    pub fn new(dev: &str) -> Self {
        Self::with_runner(dev, Box::new(SubprocessRunner))
    }

    pub fn with_runner(dev: &str, runner: Box<dyn TcRunner>) -> Self {
        Self {
            dev: dev.to_string(),
            runner,
        }
    }

    fn run(&mut self, args: Vec<String>) -> String {
        self.runner.run(&args)
    }

    fn args(&self, parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    /// Install the root HTB qdisc `1:` with the given default minor.
    pub fn install_root_htb(&mut self, default_minor: u32) {
        let args = self.args(&[
            "qdisc", "add", "dev", &self.dev, "root", "handle", "1:", "htb", "default",
            &default_minor.to_string(),
        ]);
        self.run(args);
    }

    /// Remove the root qdisc, cascading the entire hierarchy.
    pub fn remove_root(&mut self) {
        let args = self.args(&["qdisc", "del", "dev", &self.dev, "root"]);
        self.run(args);
    }

    /// Add an HTB qdisc `child:` under class `parent:parent_minor`.
    pub fn add_htb_qdisc(&mut self, parent_handle: u32, parent_minor: u32, child_handle: u32) {
        let args = self.args(&[
            "qdisc", "add", "dev", &self.dev, "parent",
            &format!("{}:{}", parent_handle, parent_minor),
            "handle", &format!("{}:", child_handle),
            "htb", "default", "1",
        ]);
        self.run(args);
    }

    /// Add a class `1:minor` in the root HTB priority tree. `parent_minor`
    /// of None attaches directly under the root qdisc.
    pub fn add_root_htb_class(
        &mut self,
        parent_minor: Option<u32>,
        minor: u32,
        rate: u64,
        ceil: Option<u64>,
        prio: u32,
    ) {
        let parent = match parent_minor {
            Some(m) => format!("1:{}", m),
            None => "1:".to_string(),
        };
        let mut args = self.args(&[
            "class", "add", "dev", &self.dev, "parent", &parent,
            "classid", &format!("1:{}", minor),
            "htb", "rate", &format!("{}bps", rate),
        ]);
        if let Some(ceil) = ceil {
            args.push("ceil".to_string());
            args.push(format!("{}bps", ceil));
        }
        args.push("prio".to_string());
        args.push(prio.to_string());
        self.run(args);
    }

    /// Add or replace a rate limiter class `parent:minor`. Replace semantics
    /// make repeated installs idempotent rate adjustments.
    pub fn add_htb_class(
        &mut self,
        parent_handle: u32,
        minor: u32,
        rate: u64,
        ceil: u64,
        burst: u64,
        cburst: u64,
    ) {
        let mut args = self.args(&[
            "class", "replace", "dev", &self.dev, "parent",
            &format!("{}:", parent_handle),
            "classid", &format!("{}:{}", parent_handle, minor),
            "htb", "rate", &format!("{}bps", rate),
            "ceil", &format!("{}bps", ceil),
        ]);
        if burst > 0 {
            args.push("burst".to_string());
            args.push(format!("{}b", burst));
        }
        if cburst > 0 {
            args.push("cburst".to_string());
            args.push(format!("{}b", cburst));
        }
        self.run(args);
    }

    /// Add a DSMARK qdisc `handle:` under class `parent:parent_minor`.
    pub fn add_dsmark_qdisc(&mut self, parent_handle: u32, parent_minor: u32, handle: u32) {
        let args = self.args(&[
            "qdisc", "add", "dev", &self.dev, "parent",
            &format!("{}:{}", parent_handle, parent_minor),
            "handle", &format!("{}:", handle),
            "dsmark", "indices", "2", "default_index", "1",
        ]);
        self.run(args);
    }

    /// Set the DSCP bits written by DSMARK class `handle:1`.
    pub fn set_dsmark_dscp(&mut self, handle: u32, value: u8) {
        // must be change, not add
        let args = self.args(&[
            "class", "change", "dev", &self.dev,
            "classid", &format!("{}:1", handle),
            "dsmark", "mask", "0x3", "value", &format!("0x{:x}", value),
        ]);
        self.run(args);
    }

    /// Add a u32 filter on qdisc `parent:` sending (dst, src) packets to
    /// class `parent:flow_minor`. The prio field carries the client identity
    /// (id + 1) so the filter can be removed again; with one filter per
    /// client the evaluation order it nominally controls is irrelevant.
    pub fn add_ip4_filter(
        &mut self,
        parent_handle: u32,
        prio: u32,
        dst: Ipv4Addr,
        src: Ipv4Addr,
        flow_minor: u32,
    ) {
        let args = self.args(&[
            "filter", "add", "dev", &self.dev, "parent",
            &format!("{}:", parent_handle),
            "protocol", "ip", "prio", &prio.to_string(),
            "u32", "match", "ip", "dst", &dst.to_string(),
            "match", "ip", "src", &src.to_string(),
            "flowid", &format!("{}:{}", parent_handle, flow_minor),
        ]);
        self.run(args);
    }

    /// Remove the filter installed on `parent:` with the given prio.
    pub fn remove_filter(&mut self, parent_handle: u32, prio: u32) {
        let args = self.args(&[
            "filter", "del", "dev", &self.dev, "parent",
            &format!("{}:", parent_handle),
            "prio", &prio.to_string(), "u32",
        ]);
        self.run(args);
    }

    /// Remove qdisc `child:` under class `parent:parent_minor`, cascading its
    /// descendants.
    pub fn remove_qdisc(&mut self, parent_handle: u32, parent_minor: u32, child_handle: u32) {
        let args = self.args(&[
            "qdisc", "del", "dev", &self.dev, "parent",
            &format!("{}:{}", parent_handle, parent_minor),
            "handle", &format!("{}:", child_handle),
        ]);
        self.run(args);
    }

    /// Remove class `parent:minor`.
    pub fn remove_class(&mut self, parent_handle: u32, minor: u32) {
        let args = self.args(&[
            "class", "del", "dev", &self.dev,
            "classid", &format!("{}:{}", parent_handle, minor),
        ]);
        self.run(args);
    }

    /// Read the kernel sent-byte counter of class `parent:minor`.
    pub fn read_sent_bytes(&mut self, parent_handle: u32, minor: u32) -> u64 {
        let args = self.args(&[
            "-s", "class", "show", "dev", &self.dev, "parent",
            &format!("{}:", parent_handle),
        ]);
        let stats = self.run(args);
        parse_sent_bytes(&stats, parent_handle, minor)
    }
}

/// Extract the `Sent` byte count for `class htb parent:minor` from
/// `tc -s class show` output. A missing class or malformed line reads as 0.
fn parse_sent_bytes(stats: &str, parent_handle: u32, minor: u32) -> u64 {
    // Trailing space so 25:2 never matches the 25:20 block
    let needle = format!("class htb {}:{} ", parent_handle, minor);
    let block_start = match stats.find(&needle) {
        Some(pos) => pos,
        None => return 0,
    };
    let rest = &stats[block_start..];
    let sent = match rest.find("Sent ") {
        Some(pos) => &rest[pos + "Sent ".len()..],
        None => return 0,
    };
    sent.split_whitespace()
        .next()
        .and_then(|token| token.parse::<u64>().ok())
        .unwrap_or(0)
}
