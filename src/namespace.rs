//! Capability namespacing utilities.
//!
//! Prefixes capability names with the owning server name using a double
//! underscore separator (e.g., `gh__list_repos`) and prepends `[via server]`
//! to descriptions. Resource URIs get the same prefix (`fs__file:///tmp/a`).

use rmcp::model::{Prompt, Resource, Tool};

/// Separator between server name and upstream capability name.
pub const SEPARATOR: &str = "__";

/// Build a namespaced capability ID. E.g., server="gh", name="list_repos" -> "gh__list_repos"
pub fn namespace_id(server: &str, name: &str) -> String {
    format!("{}{}{}", server, SEPARATOR, name)
}

fn via(server: &str, description: &str) -> String {
    format!("[via {}] {}", server, description)
}

/// Namespace a tool's name and description.
pub fn namespace_tool(server: &str, mut tool: Tool) -> Tool {
    tool.name = namespace_id(server, &tool.name).into();
    if let Some(desc) = tool.description.as_mut() {
        let prefixed = via(server, desc);
        *desc = prefixed.into();
    }
    tool
}

/// Namespace a resource's URI and description.
pub fn namespace_resource(server: &str, mut resource: Resource) -> Resource {
    resource.raw.uri = namespace_id(server, &resource.raw.uri);
    if let Some(desc) = resource.raw.description.as_mut() {
        *desc = via(server, desc);
    }
    resource
}

/// Namespace a prompt's name and description.
pub fn namespace_prompt(server: &str, mut prompt: Prompt) -> Prompt {
    prompt.name = namespace_id(server, &prompt.name);
    if let Some(desc) = prompt.description.as_mut() {
        *desc = via(server, desc);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::{AnnotateAble, RawResource};
    use serde_json::json;
    use std::sync::Arc;

    fn make_tool(name: &str, description: Option<&str>) -> Tool {
        let schema = Arc::new(
            json!({"type": "object", "properties": {}})
                .as_object()
                .unwrap()
                .clone(),
        );
        let mut tool = Tool::new(name.to_string(), "", schema);
        tool.description = description.map(|d| d.to_string().into());
        tool
    }

    #[test]
    fn test_namespace_tool_name_and_description() {
        let tool = make_tool("list_repos", Some("List repositories"));
        let namespaced = namespace_tool("gh", tool);
        assert_eq!(namespaced.name.as_ref(), "gh__list_repos");
        assert_eq!(
            namespaced.description.as_deref(),
            Some("[via gh] List repositories")
        );
    }

    #[test]
    fn test_namespace_id_keeps_separators_in_name() {
        assert_eq!(namespace_id("gh", "a__b"), "gh__a__b");
    }

    #[test]
    fn test_namespace_no_description() {
        let tool = make_tool("list_repos", None);
        let namespaced = namespace_tool("gh", tool);
        assert!(namespaced.description.is_none());
    }

    #[test]
    fn test_namespace_resource_uri() {
        let resource = RawResource::new("file:///tmp/a.txt", "a.txt").no_annotation();
        let namespaced = namespace_resource("fs", resource);
        assert_eq!(namespaced.raw.uri, "fs__file:///tmp/a.txt");
        assert_eq!(namespaced.raw.name, "a.txt");
    }

    #[test]
    fn test_namespace_prompt() {
        let prompt = Prompt::new("summarize", Some("Summarize text"), None);
        let namespaced = namespace_prompt("docs", prompt);
        assert_eq!(namespaced.name, "docs__summarize");
        assert_eq!(
            namespaced.description.as_deref(),
            Some("[via docs] Summarize text")
        );
    }
}
