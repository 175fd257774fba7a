//! Template evaluation over a service context.

use harbor_model::Service;
use serde_json::Value as Json;
use tracing::warn;

use crate::parser::{parse, Expr, Node};
use crate::TemplateError;

/// An intermediate value during evaluation.
enum Value {
    Service(Service),
    Json(Json),
}

/// Evaluates service templates.
///
/// The resolver returns a service by id and is how the `parent` accessor
/// reaches the catalog (or the coordination namespace, at dispatch time).
pub struct Evaluator<R> {
    resolver: R,
}

impl<R> Evaluator<R>
where
    R: Fn(&str) -> Option<Service>,
{
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    /// Evaluate one template with `svc` as context.
    ///
    /// Returns the empty string on any parse or evaluation failure, after
    /// logging a diagnostic. Callers keep the original value in that case.
    pub fn evaluate(&self, svc: &Service, template: &str) -> String {
        // Template-free values pass through untouched, which also makes
        // repeated evaluation idempotent.
        if !template.contains("{{") {
            return template.to_string();
        }
        match self.render(svc, template) {
            Ok(out) => out,
            Err(err) => {
                warn!(service = %svc.id, template, error = %err, "template evaluation failed");
                String::new()
            }
        }
    }

    /// Expand every templated field of `svc` in place.
    ///
    /// Non-empty expansions replace the original; failures and empty
    /// results leave it as written.
    pub fn evaluate_service(&self, svc: &mut Service) {
        let ctx = svc.clone();

        apply(&mut svc.startup, self.evaluate(&ctx, &ctx.startup));
        for (key, value) in ctx.runs.iter() {
            if let Some(slot) = svc.runs.get_mut(key) {
                apply(slot, self.evaluate(&ctx, value));
            }
        }
        for (key, value) in ctx.actions.iter() {
            if let Some(slot) = svc.actions.get_mut(key) {
                apply(slot, self.evaluate(&ctx, value));
            }
        }
        self.evaluate_endpoints(svc, &ctx);
        self.evaluate_log_configs(svc, &ctx);
    }

    /// Expand endpoint application templates.
    ///
    /// An endpoint with an `application` but no template gets the template
    /// seeded from the application, so later re-evaluation has a source.
    pub fn evaluate_endpoints(&self, svc: &mut Service, ctx: &Service) {
        for ep in &mut svc.endpoints {
            if !ep.application.is_empty() && ep.application_template.is_empty() {
                ep.application_template = ep.application.clone();
            }
            if !ep.application_template.is_empty() {
                let result = self.evaluate(ctx, &ep.application_template.clone());
                if !result.is_empty() {
                    ep.application = result;
                }
            }
        }
    }

    fn evaluate_log_configs(&self, svc: &mut Service, ctx: &Service) {
        for lc in &mut svc.log_configs {
            let path = self.evaluate(ctx, &lc.path);
            apply(&mut lc.path, path);
            let log_type = self.evaluate(ctx, &lc.log_type);
            apply(&mut lc.log_type, log_type);
            for tag in &mut lc.log_tags {
                let value = self.evaluate(ctx, &tag.value);
                apply(&mut tag.value, value);
            }
        }
    }

    fn render(&self, svc: &Service, template: &str) -> Result<String, TemplateError> {
        let nodes = parse(template)?;
        let mut out = String::new();
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(&text),
                Node::Expr(expr) => {
                    let value = self.eval_expr(svc, &expr)?;
                    out.push_str(&render_value(&value)?);
                }
            }
        }
        Ok(out)
    }

    fn eval_expr(&self, svc: &Service, expr: &Expr) -> Result<Value, TemplateError> {
        match expr {
            Expr::Current => Ok(Value::Service(svc.clone())),
            Expr::Call { func, arg } => {
                let arg = self.eval_expr(svc, arg)?;
                let Value::Service(target) = arg else {
                    return Err(TemplateError::Unrenderable);
                };
                match func.as_str() {
                    "parent" => {
                        if target.parent_id.is_empty() {
                            return Err(TemplateError::NoParent(target.id));
                        }
                        let parent = (self.resolver)(&target.parent_id)
                            .ok_or_else(|| TemplateError::Unresolved(target.parent_id.clone()))?;
                        Ok(Value::Service(parent))
                    }
                    "context" => {
                        let json: Json = serde_json::from_str(&target.context).map_err(|e| {
                            TemplateError::BadContext {
                                id: target.id.clone(),
                                source: e,
                            }
                        })?;
                        Ok(Value::Json(json))
                    }
                    other => Err(TemplateError::UnknownAccessor(other.to_string())),
                }
            }
            Expr::Field { recv, name } => {
                let recv = self.eval_expr(svc, recv)?;
                field(&recv, name)
            }
        }
    }
}

/// Replace `slot` only when the expansion produced something.
fn apply(slot: &mut String, result: String) {
    if !result.is_empty() {
        *slot = result;
    }
}

fn field(value: &Value, name: &str) -> Result<Value, TemplateError> {
    match value {
        Value::Json(Json::Object(map)) => map
            .get(name)
            .cloned()
            .map(Value::Json)
            .ok_or_else(|| TemplateError::UnknownField(name.to_string())),
        Value::Json(_) => Err(TemplateError::UnknownField(name.to_string())),
        Value::Service(svc) => {
            let json = match name {
                "Name" | "name" => Json::String(svc.name.clone()),
                "Id" | "ID" | "id" => Json::String(svc.id.clone()),
                "ParentId" | "ParentID" | "parent_id" => Json::String(svc.parent_id.clone()),
                "PoolId" | "PoolID" | "pool_id" => Json::String(svc.pool_id.clone()),
                "Startup" | "startup" => Json::String(svc.startup.clone()),
                "Instances" | "instances" => Json::from(svc.instances),
                "RamCommitment" | "RAMCommitment" | "ram_commitment" => {
                    Json::from(svc.ram_commitment)
                }
                "Context" | "context" => Json::String(svc.context.clone()),
                other => return Err(TemplateError::UnknownField(other.to_string())),
            };
            Ok(Value::Json(json))
        }
    }
}

fn render_value(value: &Value) -> Result<String, TemplateError> {
    match value {
        Value::Service(_) => Err(TemplateError::Unrenderable),
        Value::Json(json) => match json {
            Json::String(s) => Ok(s.clone()),
            Json::Number(n) => Ok(n.to_string()),
            Json::Bool(b) => Ok(b.to_string()),
            Json::Null => Ok(String::new()),
            other => serde_json::to_string(other).map_err(|_| TemplateError::Unrenderable),
        },
    }
}
