//! SQL query templates with identifier and parameter substitution.
//!
//! Queries sent to the backing database are built from templates with three
//! kinds of placeholder:
//!
//! - `${name}` — an identifier (schema, table, constraint name) substituted
//!   verbatim after validation
//! - `#{name}` — a named parameter, rendered as a positional `$n`
//!   placeholder with its value collected into the parameter list
//! - `${{name}}` — a nested query fragment, spliced in place with its own
//!   variables and parameters merged
//!
//! The template itself never executes anything; an
//! [`executor::QueryExecutor`](crate::executor::QueryExecutor) consumes the
//! rendered form.

use std::collections::BTreeMap;

use serde_json::Value;

/// Errors raised while rendering a query template.
#[derive(Debug, thiserror::Error)]
pub enum QueryBuildError {
    /// A `${name}` placeholder had no bound variable.
    #[error("unbound variable: {name}")]
    UnboundVariable {
        /// The placeholder name.
        name: String,
    },

    /// A `#{name}` placeholder had no bound parameter.
    #[error("unbound parameter: {name}")]
    UnboundParameter {
        /// The placeholder name.
        name: String,
    },

    /// A `${{name}}` placeholder had no bound fragment.
    #[error("unbound fragment: {name}")]
    UnboundFragment {
        /// The placeholder name.
        name: String,
    },

    /// A variable value is not a safe SQL identifier.
    #[error("variable {name} is not a valid identifier: {value:?}")]
    InvalidIdentifier {
        /// The placeholder name.
        name: String,
        /// The rejected value.
        value: String,
    },

    /// A placeholder was opened but never closed.
    #[error("unterminated placeholder at byte {position}")]
    UnterminatedPlaceholder {
        /// Byte offset of the opening token.
        position: usize,
    },
}

/// A SQL query template.
///
/// Built with consuming `with_*` setters and rendered once all placeholders
/// are bound:
///
/// ```rust
/// use tessera_engine::query::SqlQuery;
///
/// let query = SqlQuery::new("SELECT id FROM ${schema}.${table} WHERE version > #{v}")
///     .with_variable("schema", "public")
///     .with_variable("table", "features")
///     .with_named_parameter("v", 7);
///
/// let rendered = query.render().expect("all placeholders bound");
/// assert_eq!(rendered.text, "SELECT id FROM public.features WHERE version > $1");
/// ```
#[derive(Debug, Clone, Default)]
pub struct SqlQuery {
    text: String,
    variables: BTreeMap<String, String>,
    named_parameters: BTreeMap<String, Value>,
    fragments: BTreeMap<String, SqlQuery>,
    context: Option<Value>,
}

/// A rendered query: final text plus positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedQuery {
    /// The query text with `$n` positional placeholders.
    pub text: String,
    /// Parameter values in placeholder order.
    pub parameters: Vec<Value>,
}

impl SqlQuery {
    /// Creates a new query template from raw text.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Binds an identifier variable (`${name}`).
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Binds a named parameter (`#{name}`).
    #[must_use]
    pub fn with_named_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named_parameters.insert(name.into(), value.into());
        self
    }

    /// Binds a nested query fragment (`${{name}}`).
    #[must_use]
    pub fn with_fragment(mut self, name: impl Into<String>, fragment: SqlQuery) -> Self {
        self.fragments.insert(name.into(), fragment);
        self
    }

    /// Attaches an opaque query context forwarded to the database session.
    ///
    /// Database-side functions such as `get_task_item_and_statistics()`
    /// resolve the step's table and composite-layer setup from this context
    /// rather than from query text.
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Returns the attached query context, if any.
    #[must_use]
    pub const fn context(&self) -> Option<&Value> {
        self.context.as_ref()
    }

    /// Returns the raw (unrendered) template text.
    #[must_use]
    pub fn template_text(&self) -> &str {
        &self.text
    }

    /// Renders the template into final text and positional parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if any placeholder is unbound, a variable value is
    /// not identifier-safe, or a placeholder is unterminated.
    pub fn render(&self) -> Result<RenderedQuery, QueryBuildError> {
        let mut text = String::with_capacity(self.text.len());
        let mut parameters = Vec::new();
        self.expand(&mut text, &mut parameters)?;
        Ok(RenderedQuery { text, parameters })
    }

    fn expand(&self, out: &mut String, params: &mut Vec<Value>) -> Result<(), QueryBuildError> {
        let bytes = self.text.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
                if bytes.get(i + 2) == Some(&b'{') {
                    let (name, next) = read_placeholder(&self.text, i, "${{", "}}")?;
                    let fragment = self.fragments.get(name).ok_or_else(|| {
                        QueryBuildError::UnboundFragment { name: name.into() }
                    })?;
                    fragment.expand(out, params)?;
                    i = next;
                } else {
                    let (name, next) = read_placeholder(&self.text, i, "${", "}")?;
                    let value = self.variables.get(name).ok_or_else(|| {
                        QueryBuildError::UnboundVariable { name: name.into() }
                    })?;
                    if !is_identifier(value) {
                        return Err(QueryBuildError::InvalidIdentifier {
                            name: name.into(),
                            value: value.clone(),
                        });
                    }
                    out.push_str(value);
                    i = next;
                }
            } else if bytes[i] == b'#' && bytes.get(i + 1) == Some(&b'{') {
                let (name, next) = read_placeholder(&self.text, i, "#{", "}")?;
                let value = self.named_parameters.get(name).ok_or_else(|| {
                    QueryBuildError::UnboundParameter { name: name.into() }
                })?;
                params.push(value.clone());
                out.push('$');
                out.push_str(&params.len().to_string());
                i = next;
            } else {
                let ch = self.text[i..].chars().next().unwrap_or('\u{FFFD}');
                out.push(ch);
                i += ch.len_utf8();
            }
        }

        Ok(())
    }
}

/// Reads the name of the placeholder opening at `start` and returns it with
/// the byte offset just past the closing token.
fn read_placeholder<'a>(
    text: &'a str,
    start: usize,
    open: &str,
    close: &str,
) -> Result<(&'a str, usize), QueryBuildError> {
    let name_start = start + open.len();
    let rest = &text[name_start..];
    let end = rest
        .find(close)
        .ok_or(QueryBuildError::UnterminatedPlaceholder { position: start })?;
    Ok((&rest[..end], name_start + end + close.len()))
}

/// Returns true if `value` is safe to splice as a SQL identifier.
fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
