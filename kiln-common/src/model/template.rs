// Placeholder expansion for recipe arguments, env values and caveat text.
use std::collections::BTreeMap;

use super::option::ResolvedOptions;
use crate::error::{KilnError, Result};

/// Variables visible to `{...}` placeholders. `{opt:<name>}` reads an option value.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars<'a> {
    vars: BTreeMap<String, String>,
    options: Option<&'a ResolvedOptions>,
}

impl<'a> TemplateVars<'a> {
    pub fn new(options: &'a ResolvedOptions) -> Self {
        Self {
            vars: BTreeMap::new(),
            options: Some(options),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    fn lookup(&self, key: &str) -> Option<String> {
        if let Some(option_name) = key.strip_prefix("opt:") {
            return self
                .options
                .and_then(|opts| opts.get(option_name))
                .map(ToString::to_string);
        }
        self.vars.get(key).cloned()
    }

    pub fn expand(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut key = String::new();
                    let mut closed = false;
                    for k in chars.by_ref() {
                        if k == '}' {
                            closed = true;
                            break;
                        }
                        key.push(k);
                    }
                    if !closed {
                        return Err(KilnError::ParseError(
                            "template".to_string(),
                            format!("unterminated placeholder in '{template}'"),
                        ));
                    }
                    let value = self.lookup(key.trim()).ok_or_else(|| {
                        KilnError::ParseError(
                            "template".to_string(),
                            format!("unknown placeholder '{{{key}}}' in '{template}'"),
                        )
                    })?;
                    out.push_str(&value);
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }
}
