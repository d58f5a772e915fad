//! Minimal HTML templates for the login pages.
//!
//! Supports `{name}` substitution (HTML escaped) and non-nested
//! `{if name}...{/if}` blocks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateValue {
    Flag(bool),
    Text(String),
}

impl TemplateValue {
    fn is_truthy(&self) -> bool {
        match self {
            TemplateValue::Flag(v) => *v,
            TemplateValue::Text(v) => !v.is_empty(),
        }
    }
}

pub type TemplateVars = BTreeMap<String, TemplateValue>;

#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(&self, path: &str, vars: &TemplateVars) -> Result<String, String>;
}

/// Reads the template from disk on every render.
#[derive(Debug, Default)]
pub struct FileTemplates;

#[async_trait]
impl TemplateRenderer for FileTemplates {
    async fn render(&self, path: &str, vars: &TemplateVars) -> Result<String, String> {
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("read {path}: {e}"))?;
        render_str(&source, vars)
    }
}

const END_IF: &str = "{/if}";

pub fn render_str(template: &str, vars: &TemplateVars) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| "unterminated template tag".to_string())?;
        let tag = after[..end].trim();
        rest = &after[end + 1..];

        if let Some(cond) = tag.strip_prefix("if ") {
            let close = rest
                .find(END_IF)
                .ok_or_else(|| format!("missing {END_IF} for {}", cond.trim()))?;
            let body = &rest[..close];
            rest = &rest[close + END_IF.len()..];
            if vars.get(cond.trim()).is_some_and(TemplateValue::is_truthy) {
                out.push_str(&render_str(body, vars)?);
            }
        } else {
            match vars.get(tag) {
                Some(TemplateValue::Text(v)) => out.push_str(&escape_html(v)),
                Some(TemplateValue::Flag(v)) => out.push_str(if *v { "true" } else { "false" }),
                None => return Err(format!("undefined template variable {tag}")),
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Renders `path`, falling back to a plain notice when the template cannot
/// be rendered.
pub async fn render_or_fallback(
    renderer: &dyn TemplateRenderer,
    path: &str,
    vars: &TemplateVars,
) -> String {
    renderer.render(path, vars).await.unwrap_or_else(|e| {
        warn!(template = path, error = %e, "failed to render template");
        format!("Failed to render template {path}")
    })
}

pub fn login_vars(message: Option<&str>, error: Option<&str>) -> TemplateVars {
    let mut vars = TemplateVars::new();
    vars.insert(
        "has_message".to_string(),
        TemplateValue::Flag(message.is_some()),
    );
    vars.insert("has_error".to_string(), TemplateValue::Flag(error.is_some()));
    vars.insert(
        "message".to_string(),
        TemplateValue::Text(message.unwrap_or_default().to_string()),
    );
    vars.insert(
        "error".to_string(),
        TemplateValue::Text(error.unwrap_or_default().to_string()),
    );
    vars
}

pub fn login_success_vars(identity: &str, login_uri: &str) -> TemplateVars {
    let mut vars = TemplateVars::new();
    vars.insert("identity".to_string(), TemplateValue::Text(identity.to_string()));
    vars.insert("login_uri".to_string(), TemplateValue::Text(login_uri.to_string()));
    vars.insert(
        "cb_login_uri".to_string(),
        TemplateValue::Text(format!("cablebeach://{}", urlencoding::encode(login_uri))),
    );
    vars
}
