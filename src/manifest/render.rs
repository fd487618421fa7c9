//! Per-provider rendering of a release: variable substitution and patches

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use super::{ComponentId, ManifestBundle};
use crate::crd::ProviderSpec;
use crate::{Error, Result};

/// Render a shared bundle for one provider.
///
/// String values have `${VAR}` references substituted from `spec.variables`,
/// then every `spec.manifestPatches` entry is merged into the components it
/// targets.
pub fn render(bundle: &ManifestBundle, spec: &ProviderSpec) -> Result<ManifestBundle> {
    if spec.variables.is_empty() && spec.manifest_patches.is_empty() {
        return Ok(bundle.clone());
    }

    let mut components = bundle.components.clone();
    if !spec.variables.is_empty() {
        for component in &mut components {
            substitute_in_value(&mut component.object, &spec.variables);
            component.id = ComponentId::from_object(&component.object)?;
        }
    }

    for patch in &spec.manifest_patches {
        let target = PatchTarget::from_patch(patch)?;
        let mut matched = false;
        for component in components.iter_mut().filter(|c| target.matches(&c.id)) {
            json_patch::merge(&mut component.object, patch);
            component.id = ComponentId::from_object(&component.object)?;
            matched = true;
        }
        if !matched {
            warn!(
                provider = %bundle.provider,
                version = %bundle.version,
                target = %target,
                "Manifest patch matched no component"
            );
        }
    }

    ManifestBundle::new(
        bundle.kind,
        bundle.provider.clone(),
        bundle.version.clone(),
        components,
    )
}

struct PatchTarget<'a> {
    api_version: &'a str,
    kind: &'a str,
    name: &'a str,
    namespace: Option<&'a str>,
}

impl<'a> PatchTarget<'a> {
    fn from_patch(patch: &'a Value) -> Result<Self> {
        let get = |path: &[&str]| {
            let mut cur = patch;
            for p in path {
                cur = cur.get(p)?;
            }
            cur.as_str()
        };
        let (Some(api_version), Some(kind), Some(name)) = (
            get(&["apiVersion"]),
            get(&["kind"]),
            get(&["metadata", "name"]),
        ) else {
            return Err(Error::validation(
                "manifest patch must set apiVersion, kind and metadata.name",
            ));
        };
        Ok(Self {
            api_version,
            kind,
            name,
            namespace: get(&["metadata", "namespace"]),
        })
    }

    fn matches(&self, id: &ComponentId) -> bool {
        id.api_version == self.api_version
            && id.kind == self.kind
            && id.name == self.name
            && self
                .namespace
                .map_or(true, |ns| id.namespace.as_deref() == Some(ns))
    }
}

impl std::fmt::Display for PatchTarget<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.api_version, self.kind, self.name)
    }
}

fn substitute_in_value(value: &mut Value, vars: &BTreeMap<String, String>) {
    match value {
        Value::String(s) if s.contains("${") => *s = substitute_vars(s, vars),
        Value::Array(items) => items
            .iter_mut()
            .for_each(|v| substitute_in_value(v, vars)),
        Value::Object(map) => map
            .values_mut()
            .for_each(|v| substitute_in_value(v, vars)),
        _ => {}
    }
}

/// Substitute `${VAR}` patterns, handling bash-style defaults.
///
/// Supported patterns (matching clusterctl behavior):
/// - `${VAR}`: value from `vars`, or left as-is if missing
/// - `${VAR:=default}` and `${VAR:-default}`: value from `vars`, or `default`
/// - `${VAR="default"}`: value from `vars`, or the unquoted `default`
/// - `${VAR/#pattern/replacement}`: value from `vars`, or empty
pub fn substitute_vars(input: &str, vars: &BTreeMap<String, String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut remaining = input;

    while let Some(start) = remaining.find("${") {
        result.push_str(&remaining[..start]);
        let after_start = &remaining[start + 2..];

        if let Some(end) = after_start.find('}') {
            let expr = &after_start[..end];
            result.push_str(&resolve_var_expr(expr, vars));
            remaining = &after_start[end + 1..];
        } else {
            // unterminated, emit literally
            result.push_str("${");
            remaining = after_start;
        }
    }
    result.push_str(remaining);
    result
}

fn resolve_var_expr(expr: &str, vars: &BTreeMap<String, String>) -> String {
    if let Some(slash_pos) = expr.find("/#") {
        return vars.get(&expr[..slash_pos]).cloned().unwrap_or_default();
    }

    if let Some(pos) = expr.find(":=").or_else(|| expr.find(":-")) {
        let default = &expr[pos + 2..];
        return vars
            .get(&expr[..pos])
            .cloned()
            .unwrap_or_else(|| default.to_string());
    }

    if let Some(pos) = expr.find('=') {
        let default = expr[pos + 1..].trim_matches('"');
        return vars
            .get(&expr[..pos])
            .cloned()
            .unwrap_or_else(|| default.to_string());
    }

    vars.get(expr)
        .cloned()
        .unwrap_or_else(|| format!("${{{}}}", expr))
}
