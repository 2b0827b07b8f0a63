//! Minijinja template rendering for alert notifications.
//!
//! Templates are arbitrary strings (not pre-registered), so a fresh
//! [`minijinja::Environment`] is created per render call.

use crate::traits::NotifyError;

/// Subject of every alert.
pub const DEFAULT_SUBJECT_TEMPLATE: &str = "Anomaly Alert";

/// Body of every alert: the message and the equipment it concerns.
pub const DEFAULT_BODY_TEMPLATE: &str = "{{ message }}\nEquipment: {{ equipment_id }}";

/// Context data available to alert templates.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TemplateContext {
    pub message: String,
    pub equipment_id: String,
    /// Unique id of this alert, also recorded in logs.
    pub alert_id: String,
    /// Current timestamp in ISO 8601 format.
    pub now: String,
}

/// Renders alert templates using minijinja.
#[derive(Debug, Default)]
pub struct TemplateRenderer {
    _private: (),
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self { _private: () }
    }

    fn build_env() -> minijinja::Environment<'static> {
        let mut env = minijinja::Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        env
    }

    /// Render a template string with the given context.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Template`] if the template is invalid or
    /// references an unknown variable.
    pub fn render(&self, template_str: &str, ctx: &TemplateContext) -> Result<String, NotifyError> {
        let env = Self::build_env();
        env.render_str(template_str, ctx)
            .map_err(|e| NotifyError::Template(e.to_string()))
    }
}
