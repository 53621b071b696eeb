//! Environment-driven configuration
//!
//! Every tunable the engine recognizes is read here, once, into typed
//! structs. Components receive references to these instead of reading the
//! environment themselves.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Operator grouping used by framework masks.
pub const OP_GROUPS: &[(&str, &[&str])] = &[
    (
        "SEAL",
        &[
            "change_system",
            "change_nudge",
            "raise_temp",
            "lower_temp",
            "add_fewshot",
            "inject_memory",
            "inject_rag",
        ],
    ),
    ("WEB", &["toggle_web"]),
    ("SAMPLING", &["raise_top_k", "lower_top_k"]),
];

/// Default operator set: SEAL + WEB + SAMPLING, in group order.
pub fn default_operators() -> Vec<String> {
    OP_GROUPS
        .iter()
        .flat_map(|(_, names)| names.iter().map(|n| n.to_string()))
        .collect()
}

/// Groups an operator belongs to (falls back to `UNSET`).
pub fn groups_for_operator(name: &str) -> Vec<String> {
    let groups: Vec<String> = OP_GROUPS
        .iter()
        .filter(|(_, names)| names.contains(&name))
        .map(|(g, _)| g.to_string())
        .collect();
    if groups.is_empty() {
        vec!["UNSET".to_string()]
    } else {
        groups
    }
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "True"),
        Err(_) => default,
    }
}

/// Bandit selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanditStrategy {
    Ucb,
    EpsilonGreedy,
}

impl BanditStrategy {
    fn parse(s: &str) -> Self {
        match s {
            "egreedy" | "epsilon_greedy" => BanditStrategy::EpsilonGreedy,
            _ => BanditStrategy::Ucb,
        }
    }
}

/// Evolution loop defaults (META_* / BANDIT_* / UCB_* env).
#[derive(Debug, Clone)]
pub struct EvoDefaults {
    pub n: u32,
    pub memory_k: usize,
    pub rag_k: usize,
    pub web_k: usize,
    pub eps: f64,
    pub strategy: BanditStrategy,
    pub ucb_c: f64,
    pub warm_start_min_pulls: u32,
    pub stratified_explore: bool,
}

impl EvoDefaults {
    pub fn from_env() -> Self {
        Self {
            n: env_u32("META_DEFAULT_N", 16),
            memory_k: 3,
            rag_k: 3,
            web_k: 3,
            eps: env_f64("META_DEFAULT_EPS", 0.6),
            strategy: BanditStrategy::parse(&env_str("BANDIT_STRATEGY", "ucb")),
            ucb_c: env_f64("UCB_C", 2.0),
            warm_start_min_pulls: env_u32("WARM_START_MIN_PULLS", 1),
            stratified_explore: env_flag("STRATIFIED_EXPLORE", true),
        }
    }
}

/// Feature flags (FF_*).
#[derive(Debug, Clone)]
pub struct FeatureFlags {
    pub trajectory_log: bool,
    pub eval_gate: bool,
    pub code_loop: bool,
    pub systems_v2: bool,
    pub memory: bool,
}

impl FeatureFlags {
    pub fn from_env() -> Self {
        Self {
            trajectory_log: env_flag("FF_TRAJECTORY_LOG", true),
            eval_gate: env_flag("FF_EVAL_GATE", true),
            code_loop: env_flag("FF_CODE_LOOP", false),
            systems_v2: env_flag("FF_SYSTEMS_V2", false),
            memory: env_flag("FF_MEMORY", true),
        }
    }
}

/// Reward blending multipliers (REWARD_*).
#[derive(Debug, Clone)]
pub struct RewardConfig {
    pub alpha: f64,
    pub beta_process: f64,
    pub gamma_cost: f64,
}

impl RewardConfig {
    pub fn from_env() -> Self {
        Self {
            alpha: env_f64("REWARD_ALPHA", 1.0),
            beta_process: env_f64("REWARD_BETA_PROCESS", 0.2),
            gamma_cost: env_f64("REWARD_GAMMA_COST", -0.0005),
        }
    }
}

/// Episodic memory policy (MEMORY_*).
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub k: usize,
    pub reward_floor: f64,
    pub min_confidence: f64,
    pub baseline_reward: f64,
    pub store_max_size: usize,
    pub task_class_fuzzy: bool,
    pub reward_weight: f64,
    pub time_decay: bool,
    pub decay_days: f64,
    pub pollution_guard: bool,
    pub primer_tokens_max: usize,
    pub injection_mode: String,
    pub embedder: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl MemoryConfig {
    pub fn from_env() -> Self {
        Self {
            k: env_u32("MEMORY_K", 3) as usize,
            reward_floor: env_f64("MEMORY_REWARD_FLOOR", 0.6),
            min_confidence: env_f64("MEMORY_MIN_CONFIDENCE", 0.5),
            baseline_reward: env_f64("MEMORY_BASELINE_REWARD", 0.5),
            store_max_size: env_u32("MEMORY_STORE_MAX_SIZE", 1000) as usize,
            task_class_fuzzy: env_flag("MEMORY_TASK_CLASS_FUZZY", true),
            reward_weight: env_f64("MEMORY_REWARD_WEIGHT", 0.3),
            time_decay: env_flag("MEMORY_TIME_DECAY", true),
            decay_days: env_f64("MEMORY_DECAY_DAYS", 30.0),
            pollution_guard: env_flag("MEMORY_POLLUTION_GUARD", true),
            primer_tokens_max: env_u32("MEMORY_PRIMER_TOKENS_MAX", 200) as usize,
            injection_mode: env_str("MEMORY_INJECTION_MODE", "system_prepend"),
            embedder: env_str("MEMORY_EMBEDDER", "minilm-l6"),
        }
    }

    /// Per-normalized-task-class cap (allows ~10 classes).
    pub fn per_class_cap(&self) -> usize {
        (self.store_max_size / 10).max(1)
    }
}

/// Post-run self-improvement loop controls (CODE_LOOP_* / PHASE4_* / GOLDEN_*).
#[derive(Debug, Clone)]
pub struct CodeLoopConfig {
    pub mode: String,
    pub timeout_seconds: u64,
    pub max_per_hour: usize,
    pub delta_reward_min: f64,
    pub cost_ratio_max: f64,
    pub golden_pass_rate_target: f64,
}

impl CodeLoopConfig {
    pub fn from_env() -> Self {
        Self {
            mode: env_str("CODE_LOOP_MODE", "live"),
            timeout_seconds: env_u64("CODE_LOOP_TIMEOUT_SECONDS", 600),
            max_per_hour: env_u32("CODE_LOOP_MAX_PER_HOUR", 3) as usize,
            delta_reward_min: env_f64("PHASE4_DELTA_REWARD_MIN", 0.05),
            cost_ratio_max: env_f64("PHASE4_COST_RATIO_MAX", 0.9),
            golden_pass_rate_target: env_f64("GOLDEN_PASS_RATE_TARGET", 0.8),
        }
    }
}

/// Guard thresholds used by shadow evaluation and canary checks.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardThresholds {
    pub error_rate_max: f64,
    pub latency_p95_regression: f64,
    pub reward_delta_min: f64,
}

impl Default for GuardThresholds {
    fn default() -> Self {
        Self {
            error_rate_max: 0.15,
            latency_p95_regression: 500.0,
            reward_delta_min: -0.05,
        }
    }
}

impl GuardThresholds {
    pub fn preset(name: &str) -> Self {
        match name {
            "conservative" => Self {
                error_rate_max: 0.05,
                latency_p95_regression: 200.0,
                reward_delta_min: -0.01,
            },
            "moderate" => Self {
                error_rate_max: 0.10,
                latency_p95_regression: 350.0,
                reward_delta_min: -0.03,
            },
            "permissive" => Self {
                error_rate_max: 0.20,
                latency_p95_regression: 800.0,
                reward_delta_min: -0.10,
            },
            _ => Self::default(),
        }
    }

    /// Parse `DGM_FAIL_GUARDS`: either a preset name or comma-separated
    /// `guard=threshold` overrides on top of the defaults.
    pub fn parse(spec: &str) -> Self {
        match spec.trim() {
            "conservative" | "moderate" | "permissive" | "default" => Self::preset(spec.trim()),
            overrides => {
                let mut thresholds = Self::default();
                for pair in overrides.split(',') {
                    let Some((key, value)) = pair.split_once('=') else {
                        continue;
                    };
                    let Ok(value) = value.trim().parse::<f64>() else {
                        continue;
                    };
                    match key.trim() {
                        "error_rate_max" => thresholds.error_rate_max = value,
                        "latency_p95_regression" => thresholds.latency_p95_regression = value,
                        "reward_delta_min" => thresholds.reward_delta_min = value,
                        _ => {}
                    }
                }
                thresholds
            }
        }
    }

    pub fn as_map(&self) -> HashMap<String, f64> {
        HashMap::from([
            ("error_rate_max".to_string(), self.error_rate_max),
            (
                "latency_p95_regression".to_string(),
                self.latency_p95_regression,
            ),
            ("reward_delta_min".to_string(), self.reward_delta_min),
        ])
    }
}

/// Self-modification engine controls (DGM_*).
#[derive(Debug, Clone)]
pub struct SmeConfig {
    pub allow_commits: bool,
    pub test_before_commit: bool,
    pub allowed_areas: Vec<String>,
    pub max_loc_delta: usize,
    pub canary_runs: usize,
    pub baseline_samples: usize,
    pub shadow_timeout_secs: u64,
    pub min_reward_delta: f64,
    pub fail_guards: GuardThresholds,
    pub cpu_threshold: f64,
    pub memory_threshold_mb: u64,
    pub resource_check_enabled: bool,
    pub patch_storage_path: PathBuf,
}

impl Default for SmeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SmeConfig {
    pub fn from_env() -> Self {
        let areas = env_str("DGM_ALLOWED_AREAS", "prompts,bandit,asi_lite,rag,memory_policy,ui_metrics");
        Self {
            allow_commits: env_flag("DGM_ALLOW_COMMITS", false),
            test_before_commit: env_flag("DGM_TEST_BEFORE_COMMIT", true),
            allowed_areas: areas
                .split(',')
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect(),
            max_loc_delta: env_u32("DGM_MAX_LOC_DELTA", 50) as usize,
            canary_runs: env_u32("DGM_CANARY_RUNS", 5) as usize,
            baseline_samples: env_u32("DGM_BASELINE_SAMPLES", 1) as usize,
            shadow_timeout_secs: env_u64("DGM_SHADOW_TIMEOUT", 600),
            min_reward_delta: env_f64("DGM_MIN_REWARD_DELTA", 0.02),
            fail_guards: GuardThresholds::parse(&env_str("DGM_FAIL_GUARDS", "default")),
            cpu_threshold: env_f64("DGM_CPU_THRESHOLD", 80.0),
            memory_threshold_mb: env_u64("DGM_MEMORY_THRESHOLD_MB", 1024),
            resource_check_enabled: env_flag("DGM_RESOURCE_CHECK_ENABLED", true),
            patch_storage_path: PathBuf::from(env_str("DGM_PATCH_STORAGE_PATH", "storage/dgm/patches")),
        }
    }
}

/// Filesystem layout for persisted state.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub storage_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("storage"),
            runs_dir: PathBuf::from("runs"),
            logs_dir: PathBuf::from("logs"),
            artifacts_dir: PathBuf::from("artifacts"),
        }
    }
}

impl StorageLayout {
    pub fn rooted_at(root: &std::path::Path) -> Self {
        Self {
            storage_dir: root.join("storage"),
            runs_dir: root.join("runs"),
            logs_dir: root.join("logs"),
            artifacts_dir: root.join("artifacts"),
        }
    }

    pub fn meta_db(&self) -> PathBuf {
        self.storage_dir.join("meta.db")
    }

    pub fn memory_db(&self) -> PathBuf {
        self.storage_dir.join("memory.db")
    }

    pub fn golden_dir(&self) -> PathBuf {
        self.storage_dir.join("golden")
    }

    pub fn tuning_file(&self) -> PathBuf {
        self.storage_dir.join("tuning.json")
    }
}

/// Top-level configuration bundle held by the service.
#[derive(Debug, Clone)]
pub struct Config {
    pub evo: EvoDefaults,
    pub flags: FeatureFlags,
    pub reward: RewardConfig,
    pub memory: MemoryConfig,
    pub code_loop: CodeLoopConfig,
    pub sme: SmeConfig,
    pub layout: StorageLayout,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            evo: EvoDefaults::from_env(),
            flags: FeatureFlags::from_env(),
            reward: RewardConfig::from_env(),
            memory: MemoryConfig::from_env(),
            code_loop: CodeLoopConfig::from_env(),
            sme: SmeConfig::from_env(),
            layout: StorageLayout::default(),
        }
    }
}
