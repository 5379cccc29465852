//! Jinja2-style rendering using minijinja.
//!
//! Contexts are JSON objects (trigger payload, inputs, matrix values). A
//! template that consists of a single `{{ expression }}` is evaluated as an
//! expression so that lists and objects keep their JSON type.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, Value};

use crate::error::{EngineError, EngineResult};

/// Template renderer with custom filters.
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        // `matrix.region` on a plan without a matrix renders as undefined
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.add_filter("tojson", filter_tojson);
        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("b64decode", filter_b64decode);
        Self { env }
    }

    /// Render a template string.
    pub fn render(&self, template: &str, context: &serde_json::Value) -> EngineResult<String> {
        if !contains_template_syntax(template) {
            return Ok(template.to_string());
        }
        let tmpl = self
            .env
            .template_from_str(template)
            .map_err(|e| EngineError::Template(format!("Template parse error: {}", e)))?;
        tmpl.render(Value::from_serialize(context))
            .map_err(|e| EngineError::Template(format!("Template render error: {}", e)))
    }

    /// Render a template and return a typed JSON value.
    pub fn render_to_value(
        &self,
        template: &str,
        context: &serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        if let Some(expr) = single_expression(template) {
            let value = self.eval(expr, context)?;
            return Ok(serde_json::to_value(&value)?);
        }
        self.render(template, context).map(serde_json::Value::String)
    }

    /// Render every string inside a nested JSON value.
    pub fn render_value(
        &self,
        value: &serde_json::Value,
        context: &serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        match value {
            serde_json::Value::String(s) => self.render_to_value(s, context),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|v| self.render_value(v, context))
                .collect::<EngineResult<Vec<_>>>()
                .map(serde_json::Value::Array),
            serde_json::Value::Object(map) => {
                let mut rendered = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    rendered.insert(k.clone(), self.render_value(v, context)?);
                }
                Ok(serde_json::Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    /// Evaluate a condition. Accepts a bare expression or a `{{ }}` template.
    pub fn evaluate_condition(
        &self,
        condition: &str,
        context: &serde_json::Value,
    ) -> EngineResult<bool> {
        let expr = single_expression(condition).unwrap_or_else(|| condition.trim());
        if contains_template_syntax(expr) {
            let rendered = self.render(condition, context)?;
            return Ok(matches!(
                rendered.trim().to_lowercase().as_str(),
                "true" | "1" | "yes"
            ));
        }
        Ok(self.eval(expr, context)?.is_true())
    }

    fn eval(&self, expr: &str, context: &serde_json::Value) -> EngineResult<Value> {
        let compiled = self
            .env
            .compile_expression(expr)
            .map_err(|e| EngineError::Template(format!("Expression parse error: {}", e)))?;
        compiled
            .eval(Value::from_serialize(context))
            .map_err(|e| EngineError::Template(format!("Expression error: {}", e)))
    }
}

fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

/// `"{{ expr }}"` -> `Some("expr")` when the string is exactly one expression.
fn single_expression(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn filter_tojson(value: &Value) -> Result<String, Error> {
    serde_json::to_string(value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("tojson error: {}", e)))
}

fn filter_b64encode(value: &Value) -> String {
    BASE64.encode(value.to_string().as_bytes())
}

fn filter_b64decode(value: &Value) -> Result<String, Error> {
    let decoded = BASE64.decode(value.to_string().as_bytes()).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, format!("b64decode error: {}", e))
    })?;
    String::from_utf8(decoded)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("utf8 error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> serde_json::Value {
        json!({
            "trigger": {"branch": "main"},
            "inputs": {"regions": ["us", "eu"], "replicas": 3},
            "matrix": {"region": "us"}
        })
    }

    #[test]
    fn test_plain_string_untouched() {
        let renderer = TemplateRenderer::new();
        assert_eq!(renderer.render("deploy", &context()).unwrap(), "deploy");
    }

    #[test]
    fn test_render_interpolation() {
        let renderer = TemplateRenderer::new();
        let out = renderer
            .render("deploy-{{ matrix.region }}-{{ trigger.branch }}", &context())
            .unwrap();
        assert_eq!(out, "deploy-us-main");
    }

    #[test]
    fn test_render_to_value_keeps_types() {
        let renderer = TemplateRenderer::new();
        let regions = renderer.render_to_value("{{ inputs.regions }}", &context()).unwrap();
        assert_eq!(regions, json!(["us", "eu"]));
        let replicas = renderer.render_to_value("{{ inputs.replicas }}", &context()).unwrap();
        assert_eq!(replicas, json!(3));
    }

    #[test]
    fn test_render_value_nested() {
        let renderer = TemplateRenderer::new();
        let params = json!({"target": "{{ matrix.region }}", "args": ["--n", "{{ inputs.replicas }}"], "dry": false});
        let out = renderer.render_value(&params, &context()).unwrap();
        assert_eq!(out, json!({"target": "us", "args": ["--n", 3], "dry": false}));
    }

    #[test]
    fn test_evaluate_condition() {
        let renderer = TemplateRenderer::new();
        assert!(renderer.evaluate_condition("trigger.branch == 'main'", &context()).unwrap());
        assert!(!renderer.evaluate_condition("{{ inputs.replicas > 5 }}", &context()).unwrap());
        assert!(!renderer.evaluate_condition("inputs.missing.flag", &context()).unwrap());
    }

    #[test]
    fn test_b64encode_filter() {
        let renderer = TemplateRenderer::new();
        let out = renderer.render("{{ 'hello' | b64encode }}", &context()).unwrap();
        assert_eq!(out, "aGVsbG8=");
    }

    #[test]
    fn test_invalid_expression() {
        let renderer = TemplateRenderer::new();
        assert!(renderer.evaluate_condition("inputs.(", &context()).is_err());
    }
}
