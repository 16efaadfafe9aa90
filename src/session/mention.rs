//! 显式提及解析
//!
//! 只接受明确信号，宁可漏判不可误判：
//! 1. `UserInput.mentioned_agent_id`（前端结构化选择）
//! 2. 文本开头严格的 `@id`，后接空白或结尾

use std::sync::OnceLock;

use regex::Regex;

use crate::message::{AgentId, UserInput};

const MAX_AGENT_ID_LEN: usize = 50;
const INVALID_CHARS: &str = " @#$%^&*()+=|\\<>?/.,;:'\"`~[]{}";

static MENTION_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn mention_re() -> Option<&'static Regex> {
    MENTION_RE
        .get_or_init(|| Regex::new(r"^@([a-zA-Z0-9_\-\u{4e00}-\u{9fa5}]+)(?:\s|$)").ok())
        .as_ref()
}

/// 解析结果：被提及的 Agent 与去掉提及后发给 Agent 的文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub agent_id: AgentId,
    pub text: String,
}

/// Agent ID 的格式校验（存在性在路由时检查）
pub fn is_valid_agent_id(agent_id: &str) -> bool {
    let trimmed = agent_id.trim();
    !trimmed.is_empty()
        && trimmed.chars().count() <= MAX_AGENT_ID_LEN
        && !trimmed.chars().any(|c| INVALID_CHARS.contains(c))
}

/// 文本前缀 `@id`
pub fn parse_prefix(text: &str) -> Option<Mention> {
    let text = text.trim();
    let caps = mention_re()?.captures(text)?;
    let whole = caps.get(0)?;
    let agent_id = caps.get(1)?.as_str();
    if !is_valid_agent_id(agent_id) {
        return None;
    }
    Some(Mention {
        agent_id: agent_id.to_string(),
        text: text[whole.end()..].trim_start().to_string(),
    })
}

/// 按优先级提取提及；结构化字段优先，文本保持原样
pub fn extract(input: &UserInput) -> Option<Mention> {
    if let Some(id) = input.mentioned_agent_id.as_deref().map(str::trim) {
        if is_valid_agent_id(id) {
            let text = match parse_prefix(&input.text) {
                Some(m) if m.agent_id == id => m.text,
                _ => input.text.clone(),
            };
            return Some(Mention {
                agent_id: id.to_string(),
                text,
            });
        }
    }
    parse_prefix(&input.text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_mention() {
        let m = parse_prefix("@writer please draft").unwrap();
        assert_eq!(m.agent_id, "writer");
        assert_eq!(m.text, "please draft");

        let m = parse_prefix("@B").unwrap();
        assert_eq!(m.agent_id, "B");
        assert_eq!(m.text, "");
    }

    #[test]
    fn test_chinese_agent_id() {
        let m = parse_prefix("@助手 你好").unwrap();
        assert_eq!(m.agent_id, "助手");
        assert_eq!(m.text, "你好");
    }

    #[test]
    fn test_rejects_loose_mentions() {
        assert!(parse_prefix("hello @writer").is_none());
        assert!(parse_prefix("@writer, hi").is_none());
        assert!(parse_prefix("email@example.com").is_none());
        assert!(parse_prefix("@").is_none());
        let long = format!("@{} hi", "a".repeat(51));
        assert!(parse_prefix(&long).is_none());
    }

    #[test]
    fn test_structured_field_wins() {
        let input = UserInput {
            text: "@other hi".into(),
            mentioned_agent_id: Some("writer".into()),
            selection: None,
        };
        let m = extract(&input).unwrap();
        assert_eq!(m.agent_id, "writer");
        assert_eq!(m.text, "@other hi");

        let invalid = UserInput {
            text: "@other hi".into(),
            mentioned_agent_id: Some("bad id!".into()),
            selection: None,
        };
        assert_eq!(extract(&invalid).unwrap().agent_id, "other");
    }

    #[test]
    fn test_valid_agent_id() {
        assert!(is_valid_agent_id("agent_1-x"));
        assert!(!is_valid_agent_id(""));
        assert!(!is_valid_agent_id("a.b"));
    }
}
