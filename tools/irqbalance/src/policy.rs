// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-irq administrator policy.
//!
//! A policy script is run as `<script> <devpath> <irq>` for every discovered
//! irq and prints `key=value` lines on stdout:
//!
//!```text
//!     ban=true|false
//!     balance_level=none|package|cache|core
//!     numa_node=<node id>
//!     hintpolicy=exact|subset|ignore
//!```
//!
//! Keys and values are case insensitive. Anything unrecognized is logged and
//! ignored. A script that can't be run, or that exits nonzero without
//! printing a recognized key, yields the default policy. Keys printed before
//! a failing exit still apply.

use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use log::info;
use log::warn;

use crate::interrupts::BalanceLevel;
use crate::interrupts::HintPolicy;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IrqPolicy {
    pub ban: bool,
    pub balance_level: Option<BalanceLevel>,
    pub numa_node: Option<i32>,
    pub hint_policy: Option<HintPolicy>,
}

pub trait PolicyProvider {
    fn policy(&self, devpath: &Path, irq: u32) -> IrqPolicy;
}

/// Used when no policy script is configured.
pub struct DefaultPolicy;

impl PolicyProvider for DefaultPolicy {
    fn policy(&self, _devpath: &Path, _irq: u32) -> IrqPolicy {
        IrqPolicy::default()
    }
}

pub struct ScriptPolicy {
    script: PathBuf,
}

impl ScriptPolicy {
    pub fn new(script: &Path) -> Self {
        Self {
            script: script.to_path_buf(),
        }
    }
}

impl PolicyProvider for ScriptPolicy {
    fn policy(&self, devpath: &Path, irq: u32) -> IrqPolicy {
        let output = match Command::new(&self.script)
            .arg(devpath)
            .arg(irq.to_string())
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    "Unable to execute user policy script {:?}: {}",
                    self.script, e
                );
                return IrqPolicy::default();
            }
        };

        let pol = parse_policy_output(&String::from_utf8_lossy(&output.stdout), irq);
        if !output.status.success() && pol == IrqPolicy::default() {
            warn!(
                "Policy script {:?} failed for irq {} ({}), using default policy",
                self.script, irq, output.status
            );
        }
        pol
    }
}

pub fn parse_policy_output(output: &str, irq: u32) -> IrqPolicy {
    let mut pol = IrqPolicy::default();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => {
                warn!("Bad format for policy, ignoring: {}", line);
                continue;
            }
        };

        let applied = match key.to_ascii_lowercase().as_str() {
            "ban" => match value.to_ascii_lowercase().as_str() {
                "true" => {
                    pol.ban = true;
                    true
                }
                "false" => {
                    pol.ban = false;
                    true
                }
                _ => {
                    warn!("Unknown value for ban policy: {}", value);
                    false
                }
            },
            "balance_level" => match BalanceLevel::parse(value) {
                Some(level) => {
                    pol.balance_level = Some(level);
                    true
                }
                None => {
                    warn!("Bad value for balance_level policy: {}", value);
                    false
                }
            },
            "numa_node" => match value.parse::<i32>() {
                Ok(node) => {
                    pol.numa_node = Some(node);
                    true
                }
                Err(_) => {
                    warn!("Bad value for numa_node policy: {}", value);
                    false
                }
            },
            "hintpolicy" => match HintPolicy::parse(value) {
                Some(hint_policy) => {
                    pol.hint_policy = Some(hint_policy);
                    true
                }
                None => {
                    warn!("Unknown value for hintpolicy: {}", value);
                    false
                }
            },
            _ => {
                warn!("Unknown key returned, ignoring: {}", key);
                false
            }
        };

        if applied {
            info!("irq {}: override {} to {}", irq, key, value);
        }
    }

    pol
}
