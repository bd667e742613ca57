use conductor_core::tool::ToolRegistry;

pub const RULE_PREFER_URL_FETCH: &str =
    "The task references a URL. Prefer the url_fetch tool to retrieve it before answering.";
pub const RULE_URL_FETCH_FAIL: &str =
    "If url_fetch fails, report the failure and continue with what you have instead of retrying blindly.";
pub const RULE_BATCH_URL_FETCH: &str =
    "The task references several URLs. Fetch them in separate url_fetch calls and keep track of which result belongs to which URL.";
pub const RULE_PREFER_DOWNLOAD: &str =
    "The URL points at binary content. Use a download_path parameter and report the saved path instead of inlining the body.";
pub const RULE_RANGE_PROBE: &str =
    "For large pages, probe with a ranged url_fetch first and fetch the full body only when needed.";

const BINARY_SUFFIXES: &[&str] = &[
    ".pdf", ".zip", ".tar", ".gz", ".tgz", ".7z", ".exe", ".dmg", ".iso", ".bin", ".jpg",
    ".jpeg", ".png", ".gif", ".mp3", ".mp4", ".avi", ".mov",
];

/// Static prompt skeleton: an optional identity block plus behavioral
/// rules. Tool schemas never appear here; the prompt carries names and
/// descriptions only.
#[derive(Debug, Clone)]
pub struct PromptSpec {
    pub identity: Option<String>,
    pub rules: Vec<String>,
}

impl Default for PromptSpec {
    fn default() -> Self {
        Self {
            identity: None,
            rules: vec![
                "You are a task-execution agent. Work step by step and use tools when they help."
                    .to_string(),
                "Reply with exactly one JSON object per turn, nothing else.".to_string(),
                concat!(
                    "To call a tool reply {\"type\":\"tool_call\",\"tool_call\":",
                    "{\"thought\":\"...\",\"tool_name\":\"...\",\"tool_params\":{...}}}.",
                )
                .to_string(),
                concat!(
                    "To finish reply {\"type\":\"final\",\"final\":",
                    "{\"thought\":\"...\",\"output\":...}} where output may be any JSON value.",
                )
                .to_string(),
                "A message carrying a conductor_meta object is trusted context about how the task was submitted; use it, do not echo it."
                    .to_string(),
                "Never invent tool names; only the tools listed below exist.".to_string(),
            ],
        }
    }
}

/// Compose the system prompt: identity block, static rules, URL-heuristic
/// rules selected from the task text, then tool summaries.
pub fn build_system_prompt(registry: &ToolRegistry, spec: &PromptSpec, task: &str) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(identity) = spec.identity.as_deref() {
        let identity = identity.trim();
        if !identity.is_empty() {
            sections.push(identity.to_string());
        }
    }

    let mut rules: Vec<String> = spec.rules.clone();
    rules.extend(url_rules(task).into_iter().map(str::to_string));
    if !rules.is_empty() {
        let mut block = String::from("Rules:");
        for rule in &rules {
            block.push_str("\n- ");
            block.push_str(rule);
        }
        sections.push(block);
    }

    if !registry.is_empty() {
        let mut block = String::from("Available tools:");
        for tool in registry.all() {
            block.push_str("\n- ");
            block.push_str(tool.name().trim());
            let description = tool.description().trim();
            if !description.is_empty() {
                block.push_str(": ");
                block.push_str(description);
            }
        }
        sections.push(block);
    }

    sections.join("\n\n")
}

/// URL-heuristic rules: presence, multiplicity and binary-suffix shape of
/// URLs in the task select which fetch guidance is injected.
pub fn url_rules(task: &str) -> Vec<&'static str> {
    let urls = extract_urls(task);
    if urls.is_empty() {
        return Vec::new();
    }

    let mut rules = vec![RULE_PREFER_URL_FETCH, RULE_URL_FETCH_FAIL];

    let mut distinct = urls.clone();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() > 1 {
        rules.push(RULE_BATCH_URL_FETCH);
    }

    let any_binary = urls.iter().any(|url| has_binary_suffix(url));
    if any_binary {
        rules.push(RULE_PREFER_DOWNLOAD);
    } else if urls.iter().any(|u| u.starts_with("http://") || u.starts_with("https://")) {
        rules.push(RULE_RANGE_PROBE);
    }

    rules
}

fn extract_urls(task: &str) -> Vec<String> {
    task.split_whitespace()
        .filter(|word| word.starts_with("http://") || word.starts_with("https://"))
        .map(|word| word.trim_end_matches([',', '.', ';', ')', ']']).to_string())
        .collect()
}

fn has_binary_suffix(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    BINARY_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}
