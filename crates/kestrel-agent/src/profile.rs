//! Per-provider policy bundle: prompt, tool set, parallelism capability,
//! context window.

use kestrel::chat::Tool;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::config::ProjectDoc;
use crate::env::EnvSnapshot;
use crate::tools::ToolRegistry;

/// Policy bundle handed to a session at creation.
#[derive(Debug, Clone)]
pub struct Profile {
    /// Canonical provider key requests route to.
    pub provider: String,
    pub model: String,
    pub base_prompt: String,
    /// Approximate token capacity used for the context-usage warning.
    pub context_window: usize,
    /// Whether tool calls of one round may run concurrently.
    pub supports_parallel_tool_calls: bool,
    /// When set, only these registry tools are advertised.
    pub tool_filter: Option<Vec<String>>,
    pub knowledge_cutoff: String,
}

impl Profile {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            base_prompt: "You are a coding agent. Work through the user's task by reading, \
                          editing and running code in the sandboxed environment."
                .to_string(),
            context_window: 200_000,
            supports_parallel_tool_calls: false,
            tool_filter: None,
            knowledge_cutoff: "unknown".to_string(),
        }
    }

    /// The advertised tool definitions, filtered when a filter is set.
    pub fn tool_definitions(&self, registry: &ToolRegistry) -> Vec<Tool> {
        let mut definitions = registry.definitions();
        if let Some(filter) = &self.tool_filter {
            definitions.retain(|tool| filter.iter().any(|n| n == &tool.function.name));
        }
        definitions
    }

    pub fn context_window_size(&self) -> usize {
        self.context_window
    }

    /// Render the system prompt: base prompt, environment block, optional
    /// git block, tool list, project doc fences, then the user override.
    pub fn build_system_prompt(
        &self,
        snapshot: &EnvSnapshot,
        tools: &[Tool],
        project_docs: &[ProjectDoc],
        user_override: Option<&str>,
    ) -> String {
        let today = OffsetDateTime::now_utc()
            .format(format_description!("[year]-[month]-[day]"))
            .unwrap_or_default();

        let mut prompt = String::new();
        prompt.push_str(&self.base_prompt);
        prompt.push_str("\n\n<environment>\n");
        prompt.push_str(&format!("Working directory: {}\n", snapshot.working_directory));
        prompt.push_str(&format!("Is git repository: {}\n", snapshot.is_git_repo()));
        if let Some(git) = &snapshot.git {
            prompt.push_str(&format!("Git branch: {}\n", git.branch));
        }
        prompt.push_str(&format!("Platform: {}\n", snapshot.platform));
        prompt.push_str(&format!("OS version: {}\n", snapshot.os_version));
        prompt.push_str(&format!("Today's date: {}\n", today));
        prompt.push_str(&format!("Model: {}\n", self.model));
        prompt.push_str(&format!("Knowledge cutoff: {}\n", self.knowledge_cutoff));
        prompt.push_str("</environment>\n\n");

        if let Some(git) = &snapshot.git {
            prompt.push_str("<git>\n");
            prompt.push_str(&format!("Branch: {}\n", git.branch));
            prompt.push_str(&format!("Modified files: {}\n", git.modified_files));
            prompt.push_str(&format!("Untracked files: {}\n", git.untracked_files));
            if !git.recent_commits.is_empty() {
                prompt.push_str("Recent commits:\n");
                for subject in &git.recent_commits {
                    prompt.push_str(&format!("- {}\n", subject));
                }
            }
            prompt.push_str("</git>\n\n");
        }

        prompt.push_str("Tools:\n");
        for tool in tools {
            let summary = tool.function.description.lines().next().unwrap_or_default();
            let summary = summary.trim_start_matches("- ");
            prompt.push_str(&format!("- {}: {}\n", tool.function.name, summary));
        }
        prompt.push_str(
            "Tool usage: invoke tools through function calls; results come back as tool \
             messages. Batch independent calls where the provider allows it.\n",
        );

        for doc in project_docs {
            prompt.push_str(&format!(
                "\n----- BEGIN {} -----\n{}\n----- END {} -----\n",
                doc.path, doc.content, doc.path
            ));
        }

        if let Some(user_override) = user_override {
            if !user_override.is_empty() {
                prompt.push('\n');
                prompt.push_str(user_override);
                prompt.push('\n');
            }
        }

        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::GitInfo;
    use serde_json::json;

    fn snapshot() -> EnvSnapshot {
        EnvSnapshot {
            working_directory: "/work".into(),
            platform: "linux".into(),
            os_version: "Linux 6.1".into(),
            git: Some(GitInfo {
                branch: "main".into(),
                modified_files: 2,
                untracked_files: 1,
                recent_commits: vec!["fix retry".into(), "add glob".into()],
            }),
        }
    }

    #[test]
    fn prompt_carries_environment_git_tools_docs_and_override() {
        let profile = Profile::new("anthropic", "claude-sonnet-4-5");
        let tools = vec![kestrel::chat::Tool::function(
            "glob",
            "- Fast file pattern matching tool\n- second line",
            json!({"type": "object"}),
        )];
        let docs = vec![ProjectDoc { path: "AGENTS.md".into(), content: "be careful".into() }];

        let prompt =
            profile.build_system_prompt(&snapshot(), &tools, &docs, Some("always answer in French"));

        assert!(prompt.starts_with(&profile.base_prompt));
        assert!(prompt.contains("<environment>\nWorking directory: /work\n"));
        assert!(prompt.contains("Is git repository: true\n"));
        assert!(prompt.contains("Model: claude-sonnet-4-5\n"));
        assert!(prompt.contains("<git>\nBranch: main\nModified files: 2\nUntracked files: 1\n"));
        assert!(prompt.contains("- fix retry\n"));
        assert!(prompt.contains("Tools:\n- glob: Fast file pattern matching tool\n"));
        assert!(prompt.contains("----- BEGIN AGENTS.md -----\nbe careful\n----- END AGENTS.md -----\n"));
        assert!(prompt.trim_end().ends_with("always answer in French"));

        // Environment block field order is fixed.
        let env_block = prompt
            .split("<environment>\n")
            .nth(1)
            .unwrap()
            .split("\n</environment>")
            .next()
            .unwrap();
        let fields: Vec<&str> =
            env_block.lines().map(|l| l.split(':').next().unwrap()).collect();
        assert_eq!(
            fields,
            vec![
                "Working directory",
                "Is git repository",
                "Git branch",
                "Platform",
                "OS version",
                "Today's date",
                "Model",
                "Knowledge cutoff"
            ]
        );
    }

    #[test]
    fn non_git_snapshot_omits_git_block() {
        let profile = Profile::new("openai", "gpt-5");
        let snapshot = EnvSnapshot {
            working_directory: "/tmp".into(),
            platform: "linux".into(),
            os_version: "x".into(),
            git: None,
        };
        let prompt = profile.build_system_prompt(&snapshot, &[], &[], None);
        assert!(prompt.contains("Is git repository: false\n"));
        assert!(!prompt.contains("<git>"));
    }

    #[test]
    fn tool_filter_restricts_definitions() {
        use crate::tools::builtins::register_builtins;
        let registry = ToolRegistry::new();
        register_builtins(&registry).unwrap();

        let mut profile = Profile::new("openai", "gpt-5");
        assert!(profile.tool_definitions(&registry).len() >= 7);

        profile.tool_filter = Some(vec!["glob".into(), "shell".into()]);
        let names: Vec<String> = profile
            .tool_definitions(&registry)
            .into_iter()
            .map(|t| t.function.name)
            .collect();
        assert_eq!(names, vec!["glob".to_string(), "shell".to_string()]);
    }
}
