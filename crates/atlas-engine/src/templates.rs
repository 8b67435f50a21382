//! Template Registry (C9): a static, in-process catalog mapping template
//! name to an ordered step specification (Section 4.9). No hot-reload, no
//! DSL — templates are data, built once at startup.

use atlas_core::StepKind;
use std::collections::HashMap;

/// One step in a template's step list.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: &'static str,
    pub kind: StepKind,
    /// Steps sharing a `parallel_group` run concurrently (Section 4.7).
    pub parallel_group: Option<&'static str>,
}

impl StepSpec {
    const fn new(name: &'static str, kind: StepKind) -> Self {
        Self { name, kind, parallel_group: None }
    }
}

/// The step lists for every built-in template, looked up by name.
pub struct TemplateRegistry {
    templates: HashMap<&'static str, Vec<StepSpec>>,
}

impl TemplateRegistry {
    /// Build the registry once, at startup.
    #[must_use]
    pub fn new() -> Self {
        let mut templates = HashMap::new();
        templates.insert("standard", standard_template());
        templates.insert("hotfix", hotfix_template());
        Self { templates }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[StepSpec]> {
        self.templates.get(name).map(Vec::as_slice)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.templates.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `gather -> implement -> validate -> commit -> push -> pr -> ci -> review`.
fn standard_template() -> Vec<StepSpec> {
    vec![
        StepSpec::new("gather_context", StepKind::Gather),
        StepSpec::new("implement", StepKind::Ai),
        StepSpec::new("validate", StepKind::Validation),
        StepSpec::new("commit", StepKind::Git),
        StepSpec::new("push", StepKind::Git),
        StepSpec::new("open_pr", StepKind::Git),
        StepSpec::new("watch_ci", StepKind::Ci),
        StepSpec::new("review", StepKind::Human),
    ]
}

/// A shorter variant for urgent fixes: skips the interactive gather step.
fn hotfix_template() -> Vec<StepSpec> {
    vec![
        StepSpec::new("implement", StepKind::Ai),
        StepSpec::new("validate", StepKind::Validation),
        StepSpec::new("commit", StepKind::Git),
        StepSpec::new("push", StepKind::Git),
        StepSpec::new("open_pr", StepKind::Git),
        StepSpec::new("watch_ci", StepKind::Ci),
        StepSpec::new("review", StepKind::Human),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_template_is_registered() {
        let registry = TemplateRegistry::new();
        let steps = registry.get("standard").unwrap();
        assert_eq!(steps.first().unwrap().name, "gather_context");
        assert_eq!(steps.last().unwrap().name, "review");
    }

    #[test]
    fn hotfix_template_skips_gather() {
        let registry = TemplateRegistry::new();
        let steps = registry.get("hotfix").unwrap();
        assert!(steps.iter().all(|s| s.kind != StepKind::Gather));
        assert_eq!(steps.first().unwrap().name, "implement");
    }

    #[test]
    fn unknown_template_is_none() {
        let registry = TemplateRegistry::new();
        assert!(registry.get("does-not-exist").is_none());
    }

    #[test]
    fn names_lists_both_builtins_sorted() {
        let registry = TemplateRegistry::new();
        assert_eq!(registry.names(), vec!["hotfix", "standard"]);
    }
}
