//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AGORA__*` 覆盖（双下划线表示嵌套，如 `AGORA__SESSION__INPUT_ACK_TIMEOUT_MS=500`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub session: SessionSection,
    pub manager: ManagerSection,
    /// Agent 目录：SessionManager 只能创建这里登记过的 Agent
    pub agents: Vec<AgentEntry>,
    pub observability: ObservabilitySection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// 演示程序打开的会话 ID
    #[serde(default = "default_session_id")]
    pub session_id: String,
}

fn default_app_name() -> String {
    "agora".to_string()
}

fn default_session_id() -> String {
    "demo".to_string()
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            session_id: default_session_id(),
        }
    }
}

/// 未提及 Agent 且没有活跃 Agent 时的兜底策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAgentPolicy {
    /// 直接报 NO_ACTIVE_AGENT
    None,
    /// 最早加入的成员
    #[default]
    FirstMember,
    /// 固定的 default_agent_id（须是成员）
    Fixed,
}

/// 提及了非成员 Agent 时的策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownMentionPolicy {
    /// 报 AGENT_NOT_MEMBER
    #[default]
    Reject,
    /// 先邀请加入，成功后再路由这条输入
    Invite,
}

/// [session] 段：运行时超时与策略（毫秒）
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// T_ack
    #[serde(default = "default_ack_timeout_ms")]
    pub input_ack_timeout_ms: u64,
    /// T_cancel
    #[serde(default = "default_ack_timeout_ms")]
    pub cancel_ack_timeout_ms: u64,
    #[serde(default = "default_manager_reply_timeout_ms")]
    pub manager_reply_timeout_ms: u64,
    #[serde(default = "default_handover_decision_timeout_ms")]
    pub handover_decision_timeout_ms: u64,
    #[serde(default = "default_output_idle_timeout_ms")]
    pub output_idle_timeout_ms: u64,
    /// 终态轮次保留条数
    #[serde(default = "default_max_turn_history")]
    pub max_turn_history: usize,
    #[serde(default)]
    pub default_agent: DefaultAgentPolicy,
    pub default_agent_id: Option<String>,
    #[serde(default)]
    pub unknown_mention: UnknownMentionPolicy,
}

fn default_ack_timeout_ms() -> u64 {
    2000
}

fn default_manager_reply_timeout_ms() -> u64 {
    5000
}

fn default_handover_decision_timeout_ms() -> u64 {
    60_000
}

fn default_output_idle_timeout_ms() -> u64 {
    120_000
}

fn default_max_turn_history() -> usize {
    2000
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            input_ack_timeout_ms: default_ack_timeout_ms(),
            cancel_ack_timeout_ms: default_ack_timeout_ms(),
            manager_reply_timeout_ms: default_manager_reply_timeout_ms(),
            handover_decision_timeout_ms: default_handover_decision_timeout_ms(),
            output_idle_timeout_ms: default_output_idle_timeout_ms(),
            max_turn_history: default_max_turn_history(),
            default_agent: DefaultAgentPolicy::default(),
            default_agent_id: None,
            unknown_mention: UnknownMentionPolicy::default(),
        }
    }
}

/// [manager] 段：参考 SessionManager
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerSection {
    #[serde(default = "default_max_agents_per_session")]
    pub max_agents_per_session: usize,
    /// 新会话打开时加入的 Agent
    #[serde(default)]
    pub default_agents: Vec<String>,
}

fn default_max_agents_per_session() -> usize {
    8
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            max_agents_per_session: default_max_agents_per_session(),
            default_agents: Vec::new(),
        }
    }
}

/// [[agents]] 目录条目
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    /// Agent 实现类型，内置 echo
    #[serde(default = "default_agent_kind")]
    pub kind: String,
    pub display_name: Option<String>,
}

fn default_agent_kind() -> String {
    "echo".to_string()
}

/// [observability] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySection {
    /// 是否挂载信封日志观察者
    #[serde(default = "default_log_envelopes")]
    pub log_envelopes: bool,
    /// 会话记录保留的轮数
    #[serde(default = "default_transcript_turns")]
    pub transcript_turns: usize,
}

fn default_log_envelopes() -> bool {
    true
}

fn default_transcript_turns() -> usize {
    50
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            log_envelopes: default_log_envelopes(),
            transcript_turns: default_transcript_turns(),
        }
    }
}

/// 运行时视角的 [session] 配置
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub input_ack_timeout: Duration,
    pub cancel_ack_timeout: Duration,
    pub manager_reply_timeout: Duration,
    pub handover_decision_timeout: Duration,
    pub output_idle_timeout: Duration,
    pub max_turn_history: usize,
    pub default_agent: DefaultAgentPolicy,
    pub default_agent_id: Option<String>,
    pub unknown_mention: UnknownMentionPolicy,
}

impl From<&SessionSection> for RuntimeConfig {
    fn from(s: &SessionSection) -> Self {
        Self {
            input_ack_timeout: Duration::from_millis(s.input_ack_timeout_ms),
            cancel_ack_timeout: Duration::from_millis(s.cancel_ack_timeout_ms),
            manager_reply_timeout: Duration::from_millis(s.manager_reply_timeout_ms),
            handover_decision_timeout: Duration::from_millis(s.handover_decision_timeout_ms),
            output_idle_timeout: Duration::from_millis(s.output_idle_timeout_ms),
            max_turn_history: s.max_turn_history,
            default_agent: s.default_agent,
            default_agent_id: s.default_agent_id.clone(),
            unknown_mention: s.unknown_mention,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from(&SessionSection::default())
    }
}

/// 从 config 目录加载配置，环境变量 AGORA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AGORA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AGORA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
