//! Response extraction: turn a response body into named session values.
//!
//! An action can define a response handler which evaluates a JSONPath or XPath expression
//! against the body of a successful response, picks one of the matching values, and binds
//! it into the [`SessionState`](../session/struct.SessionState.html) of the virtual user.
//!
//! ```yaml
//! - http:
//!     title: List products
//!     method: GET
//!     url: http://localhost:8080/products
//!     response:
//!       jsonpath: $.products[*].id
//!       variable: product_id
//!       index: random
//! ```
//!
//! Expressions are compiled when the test plan is loaded, so a malformed expression stops
//! the load test before it starts. A response body that can't be decoded as JSON or XML
//! stops the load test while it's running. An expression that matches nothing leaves the
//! session unchanged.

use lazy_static::lazy_static;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json_path::JsonPath;
use std::sync::Mutex;

use crate::session::SessionState;
use crate::StampedeError;

lazy_static! {
    // Seeded once from the operating system the first time a random selection is made.
    static ref SELECTION_RNG: Mutex<StdRng> = Mutex::new(StdRng::from_os_rng());
}

/// Which of multiple matching values is bound into the session.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selection {
    /// The first match (default).
    #[default]
    First,
    /// The last match.
    Last,
    /// A randomly chosen match.
    ///
    /// When there is more than one match the final match is never chosen.
    Random,
}

/// The kind of expression a response handler evaluates.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExtractorKind {
    JsonPath,
    XmlPath,
}

/// A compiled extraction expression.
#[derive(Debug, Clone)]
pub enum Extractor {
    JsonPath {
        expression: String,
        path: JsonPath,
    },
    XmlPath {
        expression: String,
    },
}
impl Extractor {
    /// Compile an expression, failing with [`StampedeError::InvalidExpression`] if it is
    /// malformed.
    pub fn compile(kind: ExtractorKind, expression: &str) -> Result<Self, StampedeError> {
        match kind {
            ExtractorKind::JsonPath => match JsonPath::parse(expression) {
                Ok(path) => Ok(Extractor::JsonPath {
                    expression: expression.to_string(),
                    path,
                }),
                Err(e) => Err(StampedeError::InvalidExpression {
                    expression: expression.to_string(),
                    detail: format!("invalid jsonpath: {}", e),
                }),
            },
            ExtractorKind::XmlPath => {
                // Evaluating against an empty document surfaces syntax errors up front.
                let package = sxd_document::Package::new();
                let document = package.as_document();
                if let Err(e) = sxd_xpath::evaluate_xpath(&document, expression) {
                    return Err(StampedeError::InvalidExpression {
                        expression: expression.to_string(),
                        detail: format!("invalid xmlpath: {:?}", e),
                    });
                }
                Ok(Extractor::XmlPath {
                    expression: expression.to_string(),
                })
            }
        }
    }

    pub fn expression(&self) -> &str {
        match self {
            Extractor::JsonPath { expression, .. } => expression,
            Extractor::XmlPath { expression } => expression,
        }
    }

    /// Evaluate the expression against a response body, returning all matches in
    /// document order.
    pub fn evaluate(&self, body: &[u8]) -> Result<Vec<String>, StampedeError> {
        match self {
            Extractor::JsonPath { expression, path } => {
                let value: serde_json::Value = serde_json::from_slice(body).map_err(|e| {
                    StampedeError::Extraction {
                        expression: expression.to_string(),
                        detail: format!("response is not valid json: {}", e),
                    }
                })?;
                Ok(path
                    .query(&value)
                    .all()
                    .into_iter()
                    .map(|matched| match matched {
                        serde_json::Value::String(text) => text.to_string(),
                        other => other.to_string(),
                    })
                    .collect())
            }
            Extractor::XmlPath { expression } => {
                let text = std::str::from_utf8(body).map_err(|e| StampedeError::Extraction {
                    expression: expression.to_string(),
                    detail: format!("response is not valid utf-8: {}", e),
                })?;
                let package =
                    sxd_document::parser::parse(text).map_err(|e| StampedeError::Extraction {
                        expression: expression.to_string(),
                        detail: format!("response is not valid xml: {:?}", e),
                    })?;
                let document = package.as_document();
                let value = sxd_xpath::evaluate_xpath(&document, expression).map_err(|e| {
                    StampedeError::Extraction {
                        expression: expression.to_string(),
                        detail: format!("failed to evaluate xmlpath: {:?}", e),
                    }
                })?;
                Ok(match value {
                    sxd_xpath::Value::Nodeset(nodes) => nodes
                        .document_order()
                        .iter()
                        .map(|node| node.string_value())
                        .collect(),
                    sxd_xpath::Value::String(text) => vec![text],
                    sxd_xpath::Value::Number(number) => vec![number.to_string()],
                    sxd_xpath::Value::Boolean(flag) => vec![flag.to_string()],
                })
            }
        }
    }
}

/// Evaluate `kind` `expression` against `body` in one step.
pub fn evaluate(
    kind: ExtractorKind,
    expression: &str,
    body: &[u8],
) -> Result<Vec<String>, StampedeError> {
    Extractor::compile(kind, expression)?.evaluate(body)
}

/// Pick one value from the matches according to the selection policy.
pub fn select<'a>(values: &'a [String], selection: Selection) -> Option<&'a String> {
    match values.len() {
        0 => None,
        1 => values.first(),
        count => match selection {
            Selection::First => values.first(),
            Selection::Last => values.last(),
            Selection::Random => {
                let mut rng = SELECTION_RNG
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                values.get(rng.random_range(0..count - 1))
            }
        },
    }
}

/// A response handler attached to an action.
#[derive(Debug, Clone)]
pub struct ResponseExtractor {
    pub extractor: Extractor,
    pub variable: String,
    pub selection: Selection,
}
impl ResponseExtractor {
    /// Evaluate against `body` and bind the selected value into `session`.
    ///
    /// Returns the bound value, or `None` if the expression matched nothing.
    pub fn apply(
        &self,
        body: &[u8],
        session: &mut SessionState,
    ) -> Result<Option<String>, StampedeError> {
        let values = self.extractor.evaluate(body)?;
        match select(&values, self.selection) {
            Some(value) => {
                trace!("binding {} = {}", self.variable, value);
                session.insert(&self.variable, value);
                Ok(Some(value.to_string()))
            }
            None => {
                debug!(
                    "{} matched nothing, {} left unchanged",
                    self.extractor.expression(),
                    self.variable
                );
                Ok(None)
            }
        }
    }
}
