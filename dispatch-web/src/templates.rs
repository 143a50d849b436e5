//! Plain string-built HTML. Deliberately not a template engine: the
//! source renders these pages with `tornado.template`, but nothing in
//! this crate family pulls one in, and the parameter schema already
//! renders its own HTML fragments (`Parameter::as_html`) the same way --
//! one `format!` per element, joined.

use dispatch_common::registry::ModelDefinition;

/// Escapes the five characters that matter inside HTML text and
/// attribute values. Every interpolated string whose origin is a
/// submitted form field or a validation message goes through this
/// first.
pub fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html><html><head><title>{title}</title></head>\
         <body><h1>{title}</h1>{body}</body></html>"
    )
}

pub fn render_message(title: &str, body: &str) -> String {
    page(title, &format!("<p>{body}</p>"))
}

pub fn render_model_index(models: &[(String, String)]) -> String {
    let rows: String = models
        .iter()
        .map(|(name, subtitle)| format!("<li><a href=\"/models/{name}\">{name}</a> -- {subtitle}</li>"))
        .collect();
    page("Available models", &format!("<ul>{rows}</ul>"))
}

pub fn render_model_form(definition: &ModelDefinition, error: Option<&str>) -> String {
    let error_banner = error
        .map(|e| format!("<p class=\"error\">{}</p>", escape_html(e)))
        .unwrap_or_default();

    let fields: String = definition
        .parameters
        .iter()
        .filter(|p| !p.hidden)
        .map(|p| format!("<div>{}</div>", p.as_html()))
        .collect();

    let body = format!(
        "{error_banner}\
         <form method=\"post\" action=\"/submit\">\
         <input type=\"hidden\" name=\"model_name\" value=\"{name}\"/>\
         <input type=\"hidden\" name=\"model_version\" value=\"{version}\"/>\
         <label for=\"email_address\">Email address</label>\
         <input type=\"email\" name=\"email_address\" required/>\
         {fields}\
         <button type=\"submit\">Submit</button>\
         </form>",
        name = definition.short_name,
        version = definition.version,
    );

    page(&definition.subtitle, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_common::parameters::{Parameter, ParameterKind};
    use dispatch_common::registry::{RunKind, RunSpec};

    fn definition() -> ModelDefinition {
        ModelDefinition {
            short_name: "abmu".to_owned(),
            version: "v1".to_owned(),
            subtitle: "Adult Body Mass Uncertainty".to_owned(),
            body_template: "body".to_owned(),
            attachments: vec![],
            parameters: vec![Parameter::new(
                "nSamples",
                ParameterKind::Integer {
                    min: Some(1),
                    max: Some(100),
                    step: None,
                },
            )],
            run: RunSpec {
                kind: RunKind::Standalone,
                binary: "/bin/true".to_owned(),
            },
        }
    }

    #[test]
    fn form_includes_hidden_model_identity_and_error_banner() {
        let html = render_model_form(&definition(), Some("bad value"));
        assert!(html.contains("bad value"));
        assert!(html.contains("value=\"abmu\""));
        assert!(html.contains("value=\"v1\""));
        assert!(html.contains("nSamples"));
    }

    #[test]
    fn error_banner_escapes_the_submitted_error_text() {
        let html = render_model_form(&definition(), Some("<script>alert(1)</script>"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[test]
    fn hidden_parameters_are_excluded_from_the_rendered_form() {
        let mut def = definition();
        def.parameters[0].hidden = true;
        let html = render_model_form(&def, None);
        assert!(!html.contains("nSamples"));
    }
}
