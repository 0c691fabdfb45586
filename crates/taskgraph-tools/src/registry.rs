//! Built-in `ToolSpec` catalog (§3 ToolSpec, §4.6 "the registry is
//! process-wide, initialized once, immutable after init").
//!
//! Tool names and shapes follow the ones spec.md's own end-to-end scenarios
//! name literally (`list_dir`, `grep`, `apply_patch`, `run_cmd`), grounded
//! structurally on `deepseek-tools`'s per-tool `ToolSpec` table in
//! `deepseek-tools/src/lib.rs` (name/summary/args schema/side effects), with
//! the teacher's ad hoc JSON-schema literals replaced by the typed
//! `ArgSchema` builder from `taskgraph-core`.

use std::collections::BTreeMap;

use taskgraph_core::{ArgSchema, SideEffects, ToolGroup, ToolSpec};

/// The default catalog, returned in registration order. Callers wrap this in
/// an immutable snapshot (e.g. `Arc<Vec<ToolSpec>>`) at process startup.
pub fn default_tool_specs() -> Vec<ToolSpec> {
    vec![
        list_dir_spec(),
        read_file_spec(),
        write_file_spec(),
        edit_file_spec(),
        apply_patch_spec(),
        grep_spec(),
        glob_spec(),
        run_cmd_spec(),
    ]
}

fn list_dir_spec() -> ToolSpec {
    ToolSpec {
        name: "list_dir".to_string(),
        summary: "List entries of a workspace-relative directory.".to_string(),
        args_schema: ArgSchema::empty_object()
            .with_property("path", ArgSchema::string().required())
            .with_property(
                "recursive",
                ArgSchema::boolean().with_default(serde_json::json!(false)),
            ),
        example_args: serde_json::json!({"path": "src"}),
        side_effects: SideEffects::Read,
        visible_in_prompt: true,
        callable_by_model: true,
        group: ToolGroup::Readonly,
        timeout_seconds: Some(10),
    }
}

fn read_file_spec() -> ToolSpec {
    ToolSpec {
        name: "read_file".to_string(),
        summary: "Read a workspace-relative file's contents.".to_string(),
        args_schema: ArgSchema::empty_object()
            .with_property("path", ArgSchema::string().required())
            .with_property(
                "max_bytes",
                ArgSchema::integer().with_default(serde_json::json!(65536)),
            ),
        example_args: serde_json::json!({"path": "src/a.py"}),
        side_effects: SideEffects::Read,
        visible_in_prompt: true,
        callable_by_model: true,
        group: ToolGroup::Readonly,
        timeout_seconds: Some(10),
    }
}

fn write_file_spec() -> ToolSpec {
    ToolSpec {
        name: "write_file".to_string(),
        summary: "Overwrite a workspace-relative file with new contents.".to_string(),
        args_schema: ArgSchema::empty_object()
            .with_property("path", ArgSchema::string().required())
            .with_property("contents", ArgSchema::string().required()),
        example_args: serde_json::json!({"path": "src/a.py", "contents": "..."}),
        side_effects: SideEffects::Write,
        visible_in_prompt: true,
        callable_by_model: true,
        group: ToolGroup::Write,
        timeout_seconds: Some(10),
    }
}

fn edit_file_spec() -> ToolSpec {
    ToolSpec {
        name: "edit_file".to_string(),
        summary: "Replace one exact occurrence of old_text with new_text in a file.".to_string(),
        args_schema: ArgSchema::empty_object()
            .with_property("path", ArgSchema::string().required())
            .with_property("old_text", ArgSchema::string().required())
            .with_property("new_text", ArgSchema::string().required()),
        example_args: serde_json::json!({"path": "src/a.py", "old_text": "def foo():", "new_text": "def foo():\n    \"\"\"...\"\"\""}),
        side_effects: SideEffects::Write,
        visible_in_prompt: true,
        callable_by_model: true,
        group: ToolGroup::Write,
        timeout_seconds: Some(10),
    }
}

fn apply_patch_spec() -> ToolSpec {
    let hunk_schema = ArgSchema::empty_object()
        .with_property("before", ArgSchema::string().required())
        .with_property("after", ArgSchema::string().required());
    ToolSpec {
        name: "apply_patch".to_string(),
        summary: "Stage and apply context-anchored hunks to a workspace-relative file.".to_string(),
        args_schema: ArgSchema::empty_object()
            .with_property("path", ArgSchema::string().required())
            .with_property("plan_id", ArgSchema::string())
            .with_property("hunks", ArgSchema::array().with_items(hunk_schema).required()),
        example_args: serde_json::json!({
            "path": "src/a.py",
            "hunks": [{"before": "def foo():", "after": "def foo():\n    \"\"\"doc\"\"\""}],
        }),
        side_effects: SideEffects::Write,
        visible_in_prompt: true,
        callable_by_model: true,
        group: ToolGroup::Write,
        timeout_seconds: Some(10),
    }
}

fn grep_spec() -> ToolSpec {
    ToolSpec {
        name: "grep".to_string(),
        summary: "Search workspace files for a regex pattern.".to_string(),
        args_schema: ArgSchema::empty_object()
            .with_property("pattern", ArgSchema::string().required())
            .with_property(
                "path",
                ArgSchema::string().with_default(serde_json::json!(".")),
            )
            .with_property(
                "max_results",
                ArgSchema::integer().with_default(serde_json::json!(200)),
            ),
        example_args: serde_json::json!({"pattern": "TODO"}),
        side_effects: SideEffects::Read,
        visible_in_prompt: true,
        callable_by_model: true,
        group: ToolGroup::Readonly,
        timeout_seconds: Some(15),
    }
}

fn glob_spec() -> ToolSpec {
    ToolSpec {
        name: "glob".to_string(),
        summary: "Expand a glob pattern against the workspace.".to_string(),
        args_schema: ArgSchema::empty_object()
            .with_property("pattern", ArgSchema::string().required()),
        example_args: serde_json::json!({"pattern": "src/**/*.rs"}),
        side_effects: SideEffects::Read,
        visible_in_prompt: true,
        callable_by_model: true,
        group: ToolGroup::Readonly,
        timeout_seconds: Some(10),
    }
}

fn run_cmd_spec() -> ToolSpec {
    ToolSpec {
        name: "run_cmd".to_string(),
        summary: "Run a shell command in the workspace under a timeout.".to_string(),
        args_schema: ArgSchema::empty_object()
            .with_property("command", ArgSchema::string().required())
            .with_property(
                "timeout_seconds",
                ArgSchema::integer().with_default(serde_json::json!(60)),
            ),
        example_args: serde_json::json!({"command": "pytest -q"}),
        side_effects: SideEffects::Exec,
        visible_in_prompt: true,
        callable_by_model: true,
        group: ToolGroup::Exec,
        timeout_seconds: Some(120),
    }
}

/// Indexes a catalog by name for O(1) lookup during dispatch.
pub fn index_by_name(specs: &[ToolSpec]) -> BTreeMap<String, ToolSpec> {
    specs
        .iter()
        .cloned()
        .map(|spec| (spec.name.clone(), spec))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_has_no_duplicate_names() {
        let specs = default_tool_specs();
        let indexed = index_by_name(&specs);
        assert_eq!(indexed.len(), specs.len());
    }

    #[test]
    fn run_cmd_is_exec_group_with_exec_side_effects() {
        let specs = default_tool_specs();
        let run_cmd = specs.iter().find(|s| s.name == "run_cmd").expect("present");
        assert_eq!(run_cmd.group, ToolGroup::Exec);
        assert_eq!(run_cmd.side_effects, SideEffects::Exec);
    }

    #[test]
    fn read_only_tools_are_cacheable() {
        let specs = default_tool_specs();
        for name in ["list_dir", "read_file", "grep", "glob"] {
            let spec = specs.iter().find(|s| s.name == name).expect("present");
            assert!(spec.side_effects.is_cacheable());
        }
    }
}
