use std::{collections::HashMap, path::Path};

use serde::Deserialize;

use crate::error::DialogError;

/// Template used for the first stage, asking clarifying questions about the image.
pub const ASK_QUESTIONS: &str = "ask_questions";
/// Template used for the second stage, synthesizing the final answer.
pub const FINAL_DIAGNOSIS: &str = "final_diagnosis";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("template slot `{0}` was not supplied")]
    MissingSlot(String),
    #[error("unbalanced brace at offset {0}")]
    UnbalancedBrace(usize),
    #[error("unknown prompt template `{0}`")]
    UnknownTemplate(String),
}

/// A named pair of system and user format strings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PromptTemplate {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GeneralSystem {
    role: String,
    disclaimer: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SystemSection {
    general: GeneralSystem,
}

#[derive(Debug, Clone, Deserialize)]
struct PromptFile {
    system: SystemSection,
    templates: HashMap<String, PromptTemplate>,
}

/// Prompt templates loaded once at startup, plus the shared role and disclaimer text.
#[derive(Debug, Clone)]
pub struct PromptBook {
    system_role: String,
    disclaimer: String,
    templates: HashMap<String, PromptTemplate>,
}

impl PromptBook {
    pub fn new(
        system_role: impl Into<String>,
        disclaimer: impl Into<String>,
        templates: HashMap<String, PromptTemplate>,
    ) -> Self {
        Self {
            system_role: system_role.into(),
            disclaimer: disclaimer.into(),
            templates,
        }
    }

    pub fn from_yaml(source: &str) -> Result<Self, DialogError> {
        let file: PromptFile = serde_yaml::from_str(source)
            .map_err(|e| DialogError::Config(format!("invalid prompt file: {e}")))?;
        Ok(Self::new(
            file.system.general.role,
            file.system.general.disclaimer,
            file.templates,
        ))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DialogError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| DialogError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&source)
    }

    pub fn template(&self, name: &str) -> Result<&PromptTemplate, TemplateError> {
        self.templates
            .get(name)
            .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))
    }

    /// Renders the named template into a single upstream prompt.
    ///
    /// `system_role` and `disclaimer` are always available; `slots` adds the
    /// per-stage values such as `image_description` or `answers`.
    pub fn render_prompt(&self, name: &str, slots: &[(&str, &str)]) -> Result<String, TemplateError> {
        let template = self.template(name)?;
        let mut all = vec![
            ("system_role", self.system_role.as_str()),
            ("disclaimer", self.disclaimer.as_str()),
        ];
        all.extend_from_slice(slots);

        let system = render(&template.system, &all)?;
        let user = render(&template.user, &all)?;
        Ok(format!("System: {system}\n\nUser: {user}"))
    }
}

/// Substitutes `{name}` slots in `template`. `{{` and `}}` produce literal braces.
pub fn render(template: &str, slots: &[(&str, &str)]) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                out.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let start = offset + 1;
                let end = loop {
                    match chars.next() {
                        Some((i, '}')) => break i,
                        Some((_, '{')) | None => return Err(TemplateError::UnbalancedBrace(offset)),
                        Some(_) => {}
                    }
                };
                let name = &template[start..end];
                let value = slots
                    .iter()
                    .find(|(slot, _)| *slot == name)
                    .map(|(_, value)| *value)
                    .ok_or_else(|| TemplateError::MissingSlot(name.to_string()))?;
                out.push_str(value);
            }
            '}' => return Err(TemplateError::UnbalancedBrace(offset)),
            other => out.push(other),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPTS: &str = r#"
system:
  general:
    role: "You are a careful visual assistant."
    disclaimer: "Not professional advice."
templates:
  ask_questions:
    system: "{system_role} {disclaimer}"
    user: "Describe {image_description}, then write Step 2 and ask questions."
  final_diagnosis:
    system: "{system_role}"
    user: "Image: {image_description}\nAnswers: {answers}\nReply as JSON {{\"summary\": ...}}"
"#;

    #[test]
    fn render_substitutes_named_slots() {
        let out = render("{a} and {b}", &[("a", "x"), ("b", "y")]).unwrap();
        assert_eq!(out, "x and y");
    }

    #[test]
    fn render_keeps_escaped_braces() {
        let out = render("{{\"k\": \"{v}\"}}", &[("v", "1")]).unwrap();
        assert_eq!(out, "{\"k\": \"1\"}");
    }

    #[test]
    fn render_fails_on_missing_slot() {
        let err = render("hello {name}", &[]).unwrap_err();
        assert_eq!(err, TemplateError::MissingSlot("name".to_string()));
    }

    #[test]
    fn render_fails_on_unbalanced_brace() {
        assert_eq!(render("oops {", &[]), Err(TemplateError::UnbalancedBrace(5)));
        assert_eq!(render("oops }", &[]), Err(TemplateError::UnbalancedBrace(5)));
    }

    #[test]
    fn prompt_book_renders_system_and_user() {
        let book = PromptBook::from_yaml(PROMPTS).unwrap();
        let prompt = book
            .render_prompt(ASK_QUESTIONS, &[("image_description", "(image attached)")])
            .unwrap();
        assert_eq!(
            prompt,
            "System: You are a careful visual assistant. Not professional advice.\n\n\
             User: Describe (image attached), then write Step 2 and ask questions."
        );
    }

    #[test]
    fn prompt_book_requires_stage_slots() {
        let book = PromptBook::from_yaml(PROMPTS).unwrap();
        let err = book
            .render_prompt(FINAL_DIAGNOSIS, &[("image_description", "d")])
            .unwrap_err();
        assert_eq!(err, TemplateError::MissingSlot("answers".to_string()));
    }

    #[test]
    fn unknown_template_is_reported() {
        let book = PromptBook::from_yaml(PROMPTS).unwrap();
        assert!(matches!(
            book.render_prompt("nope", &[]),
            Err(TemplateError::UnknownTemplate(name)) if name == "nope"
        ));
    }
}
