use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};

use crate::pool::TestSchedStrat;
use crate::trace::SelectionStrategy;

/// Run-wide options. The dispatcher owns the master copy and sends it to
/// every node with `cluster_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchOptions {
    pub mode: ModeOptions,
    pub vm: VmOptions,
    pub svm: SvmOptions,
    pub test: TestOptions,
    pub trace: TraceOptions,
    pub profile: ProfileOptions,
    pub registration: RegistrationOptions,
    /// Parent of the per-run dispatch roots.
    pub root_dir: String,
    pub master_port: u16,
    /// How long `Draining` waits for nodes before finishing anyway.
    pub drain_timeout_secs: u64,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            mode: ModeOptions::default(),
            vm: VmOptions::default(),
            svm: SvmOptions::default(),
            test: TestOptions::default(),
            trace: TraceOptions::default(),
            profile: ProfileOptions::default(),
            registration: RegistrationOptions::default(),
            root_dir: "dispatch".to_string(),
            master_port: 10012,
            drain_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeOptions {
    /// Nodes run on other hosts; VM images are synchronized before commencing.
    pub distributed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmOptions {
    pub image: ImageOptions,
    pub arch: String,
    pub snapshot: String,
    pub args: String,
    /// Test case file (portable layout) seeding the pool instead of the
    /// guest configuration.
    pub initial_tc: Option<String>,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            image: ImageOptions::default(),
            arch: "x64".to_string(),
            snapshot: String::new(),
            args: String::new(),
            initial_tc: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptions {
    pub path: String,
    /// Push the image to VM nodes whose copy is stale.
    pub update: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvmOptions {
    pub args: SvmArgs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvmArgs {
    pub concolic: String,
    pub symbolic: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestOptions {
    pub interval: IntervalOptions,
    pub strategy: TestSchedStrat,
}

/// Limits after which dispatching stops. `None` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalOptions {
    pub trace: Option<u64>,
    pub tc: Option<u64>,
    /// Seconds.
    pub time: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceOptions {
    pub compress: bool,
    pub selection: SelectionStrategy,
    pub seed: u64,
    pub print_graph: bool,
    pub print_graph_only_branches: bool,
    pub print_elf_info: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileOptions {
    /// Seconds between statistics samples.
    pub interval: u64,
}

impl Default for ProfileOptions {
    fn default() -> Self {
        Self { interval: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationOptions {
    /// Minimum VM nodes before dispatching starts.
    pub vm_nodes: usize,
    /// Minimum SVM nodes before dispatching starts.
    pub svm_nodes: usize,
    /// Start dispatching after this many seconds even if the minimum is not met.
    pub timeout_secs: u64,
    /// How long a node gets to reconnect on its assigned port.
    pub connect_timeout_secs: u64,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            vm_nodes: 1,
            svm_nodes: 1,
            timeout_secs: 60,
            connect_timeout_secs: 10,
        }
    }
}

impl DispatchOptions {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let mut options: DispatchOptions = serde_json::from_str(raw)?;
        options.expand_env();
        Ok(options)
    }

    /// Load from `explicit`, else from the resolved default location, else
    /// fall back to defaults.
    pub fn load(explicit: Option<PathBuf>) -> anyhow::Result<Self> {
        match explicit.or_else(resolve_config_path) {
            Some(path) => {
                let raw = fs::read_to_string(&path).map_err(|e| {
                    anyhow::anyhow!("Failed to read config {}: {}", path.display(), e)
                })?;
                Self::from_json(&raw)
            }
            None => Ok(Self::default()),
        }
    }

    fn expand_env(&mut self) {
        self.root_dir = expand_env_vars(&self.root_dir);
        self.vm.image.path = expand_env_vars(&self.vm.image.path);
        if let Some(tc) = self.vm.initial_tc.as_mut() {
            *tc = expand_env_vars(tc);
        }
    }
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("DISPATCH_CONFIG") {
        return Some(PathBuf::from(p));
    }

    let candidate = PathBuf::from("dispatch.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) => out.push_str(&val),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let options = DispatchOptions::from_json(r#"{ "master_port": 9000 }"#).unwrap();
        assert_eq!(options.master_port, 9000);
        assert_eq!(options.root_dir, "dispatch");
        assert_eq!(options.registration.vm_nodes, 1);
        assert_eq!(options.test.strategy, TestSchedStrat::Fifo);
        assert_eq!(options.trace.selection, SelectionStrategy::Fifo);
    }

    #[test]
    fn test_nested_sections() {
        let raw = r#"{
            "test": { "interval": { "tc": 100, "time": 60 }, "strategy": "bfs" },
            "trace": { "compress": true, "selection": "least_treaded", "seed": 3 },
            "vm": { "image": { "path": "/img", "update": true } }
        }"#;
        let options = DispatchOptions::from_json(raw).unwrap();
        assert_eq!(options.test.interval.tc, Some(100));
        assert_eq!(options.test.interval.trace, None);
        assert_eq!(options.test.strategy, TestSchedStrat::Bfs);
        assert_eq!(options.trace.selection, SelectionStrategy::LeastTreaded);
        assert!(options.trace.compress);
        assert!(options.vm.image.update);
        assert_eq!(options.vm.arch, "x64");
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        assert!(DispatchOptions::from_json(r#"{ "trace": { "selection": "dfs" } }"#).is_err());
    }

    #[test]
    fn test_expand_env_vars_keeps_unknown() {
        assert_eq!(
            expand_env_vars("${DISPATCH_TEST_SURELY_UNSET}/x"),
            "${DISPATCH_TEST_SURELY_UNSET}/x"
        );
        assert_eq!(expand_env_vars("plain"), "plain");
    }

    #[test]
    fn test_options_survive_wire_encoding() {
        let mut options = DispatchOptions::default();
        options.vm.initial_tc = Some("seed.tc".into());
        options.test.interval.time = Some(5);
        let bytes = bincode::serialize(&options).unwrap();
        let back: DispatchOptions = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, options);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.json");
        fs::write(&path, r#"{ "root_dir": "runs" }"#).unwrap();
        let options = DispatchOptions::load(Some(path)).unwrap();
        assert_eq!(options.root_dir, "runs");
        assert!(DispatchOptions::load(Some(dir.path().join("missing.json"))).is_err());
    }
}
