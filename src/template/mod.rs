#![allow(dead_code)]

//! Template Engine (§4.5): interpolation, the `xnovu_render` recursive
//! loader with a depth/cycle guard, per-channel rendering, sanitization,
//! and template validation. Layered as:
//!
//!   parse      — tokenizer + `xnovu_render(...)` argument parser
//!   sanitize   — HTML allow-list sanitizer, text extraction, SMS truncation
//!   channel    — per-channel (EMAIL/IN_APP/SMS/PUSH/CHAT) render shaping
//!   mod (here) — template cache, recursive expansion, validator

pub mod channel;
pub mod parse;
pub mod sanitize;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::catalog::CatalogClient;
use crate::error::EngineError;
use crate::model::{Channel, Tenant, Template};

use self::channel::{ChannelRender, EmailOptions};
use self::parse::{tokenize, Token};

const DEFAULT_ERROR_PLACEHOLDER: &str = "[Template Error: {{key}}]";

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    template_key: String,
    tenant: Option<String>,
}

/// Result of rendering a single template for dispatch: the shaped
/// per-channel payload plus any non-fatal render errors accumulated along
/// the way (unknown `xnovu_render` targets, depth-cap hits, malformed
/// expressions). Render errors never fail the overall render — they
/// degrade to the `errorPlaceholder` text (§4.5) — but are surfaced so
/// callers can log them.
#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub rendered: ChannelRender,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

pub struct TemplateEngine {
    catalog: Arc<CatalogClient>,
    cache: moka::future::Cache<CacheKey, Arc<Template>>,
    max_depth: u32,
}

impl TemplateEngine {
    pub fn new(catalog: Arc<CatalogClient>, cache_ttl_seconds: u64, max_depth: u32) -> Self {
        let cache = moka::future::Cache::builder()
            .time_to_live(Duration::from_secs(cache_ttl_seconds))
            .build();
        Self {
            catalog,
            cache,
            max_depth,
        }
    }

    /// Tenant-scoped-with-global-fallback template lookup (§4.5), cached
    /// per `(template_key, tenant)` with the configured TTL.
    async fn load_template(&self, template_key: &str, tenant: &Tenant) -> Result<Arc<Template>, EngineError> {
        let key = CacheKey {
            template_key: template_key.to_string(),
            tenant: tenant.clone(),
        };
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }
        let template = self
            .catalog
            .get_template(template_key, tenant)
            .await?
            .ok_or_else(|| EngineError::TemplateNotFound(template_key.to_string()))?;
        let template = Arc::new(template);
        self.cache.insert(key, template.clone()).await;
        Ok(template)
    }

    /// Drops every cached template (§4.5 `clearCache`).
    pub async fn clear_cache(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    /// Forces eviction of entries whose TTL has already elapsed (§4.5
    /// `clearExpired`) rather than waiting for moka's lazy expiry sweep.
    pub async fn clear_expired(&self) {
        self.cache.run_pending_tasks().await;
    }

    /// Full recursive expansion of a template body: resolves `{{ path }}`
    /// variables against `vars`, and recursively loads + expands
    /// `{{ xnovu_render('key', {...}) }}` calls up to `max_depth`. Depth
    /// overruns and unknown template keys degrade to the error placeholder
    /// rather than failing the whole render (§4.5).
    fn expand<'a>(
        &'a self,
        body: &'a str,
        tenant: &'a Tenant,
        vars: &'a Map<String, Value>,
        depth: u32,
        errors: &'a mut Vec<String>,
    ) -> Pin<Box<dyn Future<Output = String> + Send + 'a>> {
        Box::pin(async move {
            let tokens = tokenize(body);
            let mut out = String::new();
            for token in tokens {
                match token {
                    Token::Literal(text) => out.push_str(&text),
                    Token::Var { path, raw } => match resolve_path(vars, &path) {
                        Some(value) => out.push_str(&value_to_display(&value)),
                        None => out.push_str(&format!("{{{{{raw}}}}}")),
                    },
                    Token::Malformed(raw) => {
                        errors.push(format!("malformed template expression: {}", raw.trim()));
                        out.push_str(&format!("{{{{{raw}}}}}"));
                    }
                    Token::Render { template_key, args } => {
                        if depth >= self.max_depth {
                            errors.push(format!(
                                "max render depth {} exceeded while loading '{template_key}'",
                                self.max_depth
                            ));
                            out.push_str(&self.render_error_placeholder(&template_key, vars));
                            continue;
                        }
                        match self.load_template(&template_key, tenant).await {
                            Ok(nested) => {
                                let merged = merge_vars(vars, &args);
                                let nested_body = nested.body_template.clone();
                                let expanded = self
                                    .expand(&nested_body, tenant, &merged, depth + 1, errors)
                                    .await;
                                out.push_str(&expanded);
                            }
                            Err(_) => {
                                errors.push(format!("unknown template '{template_key}' referenced by xnovu_render"));
                                out.push_str(&self.render_error_placeholder(&template_key, vars));
                            }
                        }
                    }
                }
            }
            out
        })
    }

    fn render_error_placeholder(&self, key: &str, vars: &Map<String, Value>) -> String {
        let mut scratch_errors = Vec::new();
        let mut scratch_vars = vars.clone();
        scratch_vars.insert("key".to_string(), Value::String(key.to_string()));
        // The placeholder text is itself interpolated (§4.5), but never
        // recurses into xnovu_render — that would defeat the depth guard.
        plain_interpolate(DEFAULT_ERROR_PLACEHOLDER, &scratch_vars, &mut scratch_errors)
    }

    /// Renders a stored `Template` for dispatch: expands the body (and
    /// subject, for EMAIL) against `vars`, then shapes the result for the
    /// template's channel (§4.5).
    pub async fn render(
        &self,
        template: &Template,
        tenant: &Tenant,
        vars: &Map<String, Value>,
        email_opts: &EmailOptions,
    ) -> RenderOutcome {
        let mut errors = Vec::new();
        let body = self.expand(&template.body_template, tenant, vars, 0, &mut errors).await;
        let subject = match &template.subject_template {
            Some(subject_template) => Some(self.expand(subject_template, tenant, vars, 0, &mut errors).await),
            None => None,
        };

        let rendered = match template.channel_type {
            Channel::Email => ChannelRender::Email(channel::render_email(&body, subject.as_deref(), email_opts)),
            Channel::InApp => ChannelRender::InApp(channel::render_in_app(&body)),
            Channel::Sms => ChannelRender::Sms(channel::render_sms(&body)),
            Channel::Push => {
                let title = subject.unwrap_or_default();
                ChannelRender::Push(channel::render_push(&title, &body))
            }
            Channel::Chat => ChannelRender::Chat(channel::render_chat(&body)),
        };

        RenderOutcome { rendered, errors }
    }

    /// Loads `template_key` (tenant-then-global, cached) and renders it —
    /// the entry point the Dispatch Adapter uses for per-channel rendering
    /// (§4.6 step 2), as opposed to `render`, which takes an
    /// already-loaded `Template`.
    pub async fn render_by_key(
        &self,
        template_key: &str,
        tenant: &Tenant,
        vars: &Map<String, Value>,
        email_opts: &EmailOptions,
    ) -> Result<RenderOutcome, EngineError> {
        let template = self.load_template(template_key, tenant).await?;
        Ok(self.render(&template, tenant, vars, email_opts).await)
    }

    /// Static validation of a stored template (§4.5): unbalanced
    /// `{{`/`}}`, empty `{{ }}`, malformed `xnovu_render` arguments, and
    /// `xnovu_render` calls referencing a template key that does not
    /// resolve for `tenant`. Does not execute a render.
    pub async fn validate(&self, template: &Template, tenant: &Tenant) -> ValidationResult {
        let mut errors = Vec::new();
        self.validate_body(&template.body_template, tenant, &mut errors).await;
        if let Some(subject) = &template.subject_template {
            self.validate_body(subject, tenant, &mut errors).await;
            if template.channel_type == Channel::Email && sanitize::contains_script_tag(subject) {
                errors.push("email subject template must not contain a <script> tag".to_string());
            }
        }
        ValidationResult {
            valid: errors.is_empty(),
            errors,
        }
    }

    async fn validate_body(&self, body: &str, tenant: &Tenant, errors: &mut Vec<String>) {
        for token in tokenize(body) {
            match token {
                Token::Malformed(raw) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        errors.push("empty {{ }} expression".to_string());
                    } else {
                        errors.push(format!("malformed template expression: {trimmed}"));
                    }
                }
                Token::Render { template_key, .. } => {
                    if self.catalog.get_template(&template_key, tenant).await.ok().flatten().is_none() {
                        errors.push(format!("xnovu_render references unknown template '{template_key}'"));
                    }
                }
                Token::Literal(_) | Token::Var { .. } => {}
            }
        }
    }
}

/// Path-only interpolation with no recursive template loading — used by
/// the Dispatch Adapter to interpolate `record.overrides` string leaves
/// against `record.payload` (§4.6), where a nested `xnovu_render` call
/// would be meaningless.
pub fn interpolate_plain(body: &str, vars: &Map<String, Value>) -> String {
    let mut errors = Vec::new();
    plain_interpolate(body, vars, &mut errors)
}

fn plain_interpolate(body: &str, vars: &Map<String, Value>, errors: &mut Vec<String>) -> String {
    let mut out = String::new();
    for token in tokenize(body) {
        match token {
            Token::Literal(text) => out.push_str(&text),
            Token::Var { path, raw } => match resolve_path(vars, &path) {
                Some(value) => out.push_str(&value_to_display(&value)),
                None => out.push_str(&format!("{{{{{raw}}}}}")),
            },
            Token::Render { .. } => {
                // Overrides do not trigger recursive template loads; left
                // as-is, same as a missing path.
            }
            Token::Malformed(raw) => {
                errors.push(format!("malformed expression: {}", raw.trim()));
                out.push_str(&format!("{{{{{raw}}}}}"));
            }
        }
    }
    out
}

fn resolve_path(vars: &Map<String, Value>, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let (first_key, first_index) = split_index(first);
    let mut current = vars.get(first_key)?.clone();
    if let Some(idx) = first_index {
        current = current.get(idx)?.clone();
    }
    for segment in segments {
        let (key, index) = split_index(segment);
        current = current.get(key)?.clone();
        if let Some(idx) = index {
            current = current.get(idx)?.clone();
        }
    }
    Some(current)
}

/// Splits `items[0]` into `("items", Some(0))`; `name` stays `("name", None)`.
fn split_index(segment: &str) -> (&str, Option<usize>) {
    if let Some(bracket) = segment.find('[') {
        if let Some(stripped) = segment[bracket..].strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Ok(idx) = stripped.parse::<usize>() {
                return (&segment[..bracket], Some(idx));
            }
        }
    }
    (segment, None)
}

/// `null` renders as the literal text `"null"` (§4.5) — distinct from a
/// missing path, which is left as the unresolved `{{ path }}` token.
fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Merges the caller's `xnovu_render('key', { ... })` argument object on
/// top of the current variable scope — nested templates see both their own
/// arguments and the outer context, with the call's own arguments winning.
fn merge_vars(outer: &Map<String, Value>, call_args: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = outer.clone();
    for (k, v) in call_args {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn resolves_simple_path() {
        let v = vars(&[("name", Value::String("Ada".to_string()))]);
        assert_eq!(resolve_path(&v, "name"), Some(Value::String("Ada".to_string())));
    }

    #[test]
    fn resolves_nested_array_path() {
        let v = vars(&[(
            "user",
            serde_json::json!({"items": [{"name": "widget"}]}),
        )]);
        assert_eq!(
            resolve_path(&v, "user.items[0].name"),
            Some(Value::String("widget".to_string()))
        );
    }

    #[test]
    fn missing_path_returns_none() {
        let v = vars(&[]);
        assert_eq!(resolve_path(&v, "missing.path"), None);
    }

    #[test]
    fn null_value_renders_as_literal_null() {
        let v = vars(&[("deleted_at", Value::Null)]);
        let out = interpolate_plain("Deleted: {{ deleted_at }}", &v);
        assert_eq!(out, "Deleted: null");
    }

    #[test]
    fn plain_interpolate_resolves_vars_and_ignores_render() {
        let v = vars(&[("name", Value::String("Ada".to_string()))]);
        let out = interpolate_plain("Hi {{ name }}, {{ xnovu_render('x') }}", &v);
        assert_eq!(out, "Hi Ada, {{ xnovu_render('x') }}");
    }

    #[test]
    fn plain_interpolate_leaves_missing_var_verbatim() {
        let v = vars(&[]);
        let out = interpolate_plain("Hi {{ missing }}", &v);
        assert_eq!(out, "Hi {{ missing }}");
    }

    #[test]
    fn merge_vars_overrides_outer_with_call_args() {
        let outer = vars(&[("year", Value::from(2025))]);
        let call_args = vars(&[("year", Value::from(2026))]);
        let merged = merge_vars(&outer, &call_args);
        assert_eq!(merged.get("year"), Some(&Value::from(2026)));
    }
}
