//! Template rendering for step parameters and node conditions.

pub mod jinja;

pub use jinja::TemplateRenderer;
