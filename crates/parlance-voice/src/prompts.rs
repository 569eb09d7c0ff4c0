//! Spoken notices for tool calls.
//!
//! While a tool runs the text stream goes quiet, so the listener hears a
//! short notice naming what is happening. Notices are sent as standalone
//! audio and never become part of a stored clip.

use std::collections::HashMap;

use parlance_types::ToolCall;

const DEFAULT_PROMPTS: &[(&str, &str)] = &[
    ("write_file", "请稍后，正在准备进行写入文件操作。"),
    ("read_file", "请稍后，正在读取文件内容。"),
    ("show_tree", "请稍后，正在列出文件目录结构。"),
    ("delete_file", "请稍后，正在删除文件，请注意操作。"),
    ("open_file", "请稍后，正在打开文件。"),
    ("rename_path", "请稍后，正在重命名文件或文件夹。"),
    ("copy_path", "请稍后，正在复制文件或文件夹。"),
    ("move_path", "请稍后，正在移动文件或文件夹。"),
    ("run_command", "请稍后，正在执行系统命令。"),
    ("create_dir", "请稍后，正在创建新目录。"),
];

/// Tool name to spoken notice.
#[derive(Debug, Clone)]
pub struct ToolPrompts {
    prompts: HashMap<String, String>,
}

impl Default for ToolPrompts {
    fn default() -> Self {
        Self {
            prompts: DEFAULT_PROMPTS
                .iter()
                .map(|(name, text)| (name.to_string(), text.to_string()))
                .collect(),
        }
    }
}

impl ToolPrompts {
    /// Built-in notices overlaid with `overrides`.
    pub fn with_overrides(overrides: HashMap<String, String>) -> Self {
        let mut prompts = Self::default();
        prompts.prompts.extend(overrides);
        prompts
    }

    pub fn get(&self, tool_name: &str) -> Option<&str> {
        self.prompts.get(tool_name).map(String::as_str)
    }

    /// Joins the notices for `calls` in call order. Tools without a notice
    /// are skipped.
    pub fn for_calls(&self, calls: &[ToolCall]) -> Option<String> {
        let mut text = String::new();
        for call in calls {
            match self.get(&call.name) {
                Some(prompt) => text.push_str(prompt),
                None => tracing::debug!(tool = %call.name, "no voice prompt for tool"),
            }
        }
        (!text.is_empty()).then_some(text)
    }
}
