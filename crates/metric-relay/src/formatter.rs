// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use regex::{Captures, Regex};
use serde_json::Value;

use crate::errors::{FormatError, ResolveError};
use crate::expr;
use crate::path::{self, FieldPath, Resolved};

const PLACEHOLDER: &str = r"\{(.*?)\}";

/// How a single-valued setting (instance, device, timestamp) is looked up.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// Not configured; the caller's default applies.
    Unset,
    /// A `{field}` template, built from the first configured candidate.
    Template(String),
    /// Candidate paths tried in order.
    Priority(Vec<FieldPath>),
}

/// A parsed data field spec.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSpec {
    /// `name:value`. The name may itself be a template.
    Named { name: String, value: ValueSpec },
    /// A bare path; the path text doubles as the field name.
    Path(FieldPath),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueSpec {
    /// `=expr`, evaluated after placeholder substitution.
    Expression(String),
    Template(String),
    Literal(String),
}

/// Resolves templates, field specs and priority lists against a message.
///
/// Built once from configuration and shared read-only between workers.
#[derive(Debug, Clone)]
pub struct ValueFormatter {
    placeholder: Regex,
}

impl Default for ValueFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueFormatter {
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        ValueFormatter {
            placeholder: Regex::new(PLACEHOLDER).expect("placeholder pattern is valid"),
        }
    }

    #[must_use]
    pub fn is_template(&self, text: &str) -> bool {
        self.placeholder.is_match(text)
    }

    /// Compiles a candidate list into a [`Selector`].
    #[must_use]
    pub fn selector(&self, candidates: &[String]) -> Selector {
        let candidates: Vec<&String> = candidates.iter().filter(|c| !c.trim().is_empty()).collect();
        match candidates.first() {
            None => Selector::Unset,
            Some(first) if self.is_template(first) => Selector::Template((*first).clone()),
            Some(_) => Selector::Priority(
                candidates
                    .iter()
                    .map(|c| FieldPath::parse(c))
                    .filter(|p| !p.is_empty())
                    .collect(),
            ),
        }
    }

    /// Parses `name:value` (split on the first `:`) or a bare path.
    #[must_use]
    pub fn field_spec(&self, spec: &str) -> FieldSpec {
        let Some((name, value)) = spec.split_once(':') else {
            return FieldSpec::Path(FieldPath::parse(spec));
        };
        let value = value.trim();
        let value = if let Some(expression) = value.strip_prefix('=') {
            ValueSpec::Expression(expression.trim().to_string())
        } else if self.is_template(value) {
            ValueSpec::Template(value.to_string())
        } else {
            ValueSpec::Literal(value.to_string())
        };
        FieldSpec::Named {
            name: name.trim().to_string(),
            value,
        }
    }

    /// Substitutes every `{field}` placeholder in `template`.
    ///
    /// A template that is exactly one placeholder returns the resolved value untouched so
    /// list values can still fan out. If nothing resolves, `default` is returned.
    pub fn resolve_template(
        &self,
        msg: &mut Value,
        template: &str,
        default: &str,
        allow_list: bool,
        consume: bool,
    ) -> Result<Resolved, ResolveError> {
        let mut fields: Vec<(String, Resolved)> = Vec::new();
        let mut found: Vec<FieldPath> = Vec::new();
        for caps in self.placeholder.captures_iter(template) {
            let field = &caps[1];
            if fields.iter().any(|(f, _)| f == field) {
                continue;
            }
            let path = FieldPath::parse(field);
            let value = path::resolve(msg, &path, allow_list)?;
            if !value.is_empty() {
                found.push(path);
            }
            fields.push((field.to_string(), value));
        }
        // nothing is consumed unless every placeholder resolved
        if consume {
            for path in &found {
                path::resolve_consume(msg, path, allow_list)?;
            }
        }

        if fields.iter().all(|(_, v)| v.is_empty()) {
            return Ok(scalar_or_empty(default));
        }

        if let [(field, _)] = fields.as_slice() {
            if template.len() == field.len() + 2 {
                return Ok(fields.swap_remove(0).1);
            }
        }

        let text = self
            .placeholder
            .replace_all(template, |caps: &Captures| {
                fields
                    .iter()
                    .find(|(f, _)| f == &caps[1])
                    .map(|(_, v)| v.to_text())
                    .unwrap_or_default()
            })
            .into_owned();
        Ok(Resolved::Scalar(text))
    }

    /// Resolves a data field spec to its output name and value.
    pub fn resolve_field_spec(
        &self,
        msg: &mut Value,
        spec: &FieldSpec,
    ) -> Result<(String, Resolved), FormatError> {
        match spec {
            FieldSpec::Path(path) => Ok((path.to_string(), path::resolve(msg, path, true)?)),
            FieldSpec::Named { name, value } => {
                let name = if self.is_template(name) {
                    self.resolve_template(msg, name, name, false, false)?.to_text()
                } else {
                    name.clone()
                };
                let value = match value {
                    ValueSpec::Literal(literal) => scalar_or_empty(literal),
                    ValueSpec::Template(template) => {
                        self.resolve_template(msg, template, "", true, false)?
                    }
                    ValueSpec::Expression(expression) => {
                        let text = if self.is_template(expression) {
                            self.resolve_template(msg, expression, expression, true, false)?
                                .to_text()
                        } else {
                            expression.clone()
                        };
                        let result = expr::evaluate(&text).map_err(|source| {
                            FormatError::Expression {
                                expression: text.clone(),
                                source,
                            }
                        })?;
                        Resolved::Scalar(expr::format_number(result))
                    }
                };
                Ok((name, value))
            }
        }
    }

    /// Returns the first candidate that resolves to a value, otherwise `default`.
    pub fn resolve_priority(
        &self,
        msg: &mut Value,
        candidates: &[FieldPath],
        default: &str,
        allow_list: bool,
        consume: bool,
    ) -> Result<Resolved, ResolveError> {
        for candidate in candidates {
            let value = lookup(msg, candidate, allow_list, consume)?;
            if !value.is_empty() {
                return Ok(value);
            }
        }
        Ok(scalar_or_empty(default))
    }

    /// Resolves a single-valued setting.
    pub fn resolve_single(
        &self,
        msg: &mut Value,
        selector: &Selector,
        default: &str,
        allow_list: bool,
        consume: bool,
    ) -> Result<Resolved, ResolveError> {
        match selector {
            Selector::Unset => Ok(scalar_or_empty(default)),
            Selector::Template(template) => {
                self.resolve_template(msg, template, default, allow_list, consume)
            }
            Selector::Priority(candidates) => {
                self.resolve_priority(msg, candidates, default, allow_list, consume)
            }
        }
    }
}

fn lookup(
    msg: &mut Value,
    path: &FieldPath,
    allow_list: bool,
    consume: bool,
) -> Result<Resolved, ResolveError> {
    if consume {
        path::resolve_consume(msg, path, allow_list)
    } else {
        path::resolve(msg, path, allow_list)
    }
}

fn scalar_or_empty(text: &str) -> Resolved {
    if text.is_empty() {
        Resolved::Empty
    } else {
        Resolved::Scalar(text.to_string())
    }
}
