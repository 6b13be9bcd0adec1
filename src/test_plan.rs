//! Test plan structures and functions.
//!
//! A test plan describes how many virtual users to simulate, how quickly to start them,
//! how many times each replays the scripted actions, and how fast requests may be made.
//! Plans are written in YAML:
//!
//! ```yaml
//! users: 5
//! rampup: 10
//! iterations: 20
//! rate: 50
//! feeder:
//!   type: csv
//!   filename: accounts.csv
//! actions:
//!   - http:
//!       title: Login
//!       method: POST
//!       url: http://localhost:8080/login
//!       body: '{"user": "${username}"}'
//!       content_type: application/json
//!       store_cookie: JSESSIONID
//!   - https:
//!       title: Profile
//!       method: GET
//!       url: https://localhost:8443/profile/${UID}
//!   - tcp:
//!       title: Ping
//!       address: localhost:9000
//!       payload: PING ${UID}
//! ```
//!
//! Each entry of `actions` is a single-key map naming the protocol.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::action::Action;
use crate::extract::{Extractor, ExtractorKind, Selection};
use crate::StampedeError;

/// Complete definition of one load test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPlan {
    /// How many virtual users to simulate.
    pub users: usize,
    /// Seconds over which to start all virtual users, 0 starts them all at once.
    #[serde(default)]
    pub rampup: f64,
    /// How many times each virtual user replays the actions.
    pub iterations: usize,
    /// Maximum requests per second across all users, 0 disables throttling.
    #[serde(default)]
    pub rate: usize,
    /// Optional number of concurrent executors, overridden by `--concurrency`.
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Optional source of per-iteration data.
    #[serde(default)]
    pub feeder: Option<FeederSpec>,
    /// The scripted actions, replayed in order.
    pub actions: Vec<ActionSpec>,
}

/// One scripted action, exactly one of the fields must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpActionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<HttpActionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpActionSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpActionSpec {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub accept: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Request body used when `body` isn't set.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub response: Option<ResponseSpec>,
    /// Name of a response cookie to capture and replay on later requests.
    #[serde(default)]
    pub store_cookie: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpActionSpec {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub address: String,
    /// Written to the connection followed by `\r\n`.
    #[serde(default)]
    pub payload: String,
    /// Read one line back after writing the payload.
    #[serde(default)]
    pub read_response: bool,
}

/// Extraction rule applied to successful responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseSpec {
    #[serde(default)]
    pub jsonpath: Option<String>,
    #[serde(default)]
    pub xmlpath: Option<String>,
    #[serde(default)]
    pub variable: String,
    #[serde(default)]
    pub index: Selection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeederSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub filename: String,
    #[serde(default)]
    pub delimiter: Option<String>,
}
impl FeederSpec {
    /// The configured delimiter, defaulting to a comma.
    pub fn delimiter(&self) -> u8 {
        self.delimiter
            .as_ref()
            .and_then(|delimiter| delimiter.bytes().next())
            .unwrap_or(b',')
    }
}

// Shorthand for plan validation failures.
fn invalid(detail: String) -> StampedeError {
    StampedeError::InvalidPlan { detail }
}

impl ActionSpec {
    /// Name used in logs and validation errors.
    pub fn title(&self) -> &str {
        if let Some(http) = self.http.as_ref() {
            &http.title
        } else if let Some(https) = self.https.as_ref() {
            &https.title
        } else if let Some(tcp) = self.tcp.as_ref() {
            &tcp.title
        } else {
            ""
        }
    }

    fn validate(&self, index: usize) -> Result<(), StampedeError> {
        let defined = [
            self.http.is_some(),
            self.https.is_some(),
            self.tcp.is_some(),
        ]
        .iter()
        .filter(|defined| **defined)
        .count();
        if defined != 1 {
            return Err(invalid(format!(
                "action {} must define exactly one of http, https or tcp (found {})",
                index + 1,
                defined
            )));
        }

        if let Some(http) = self.http.as_ref().or(self.https.as_ref()) {
            if http.url.is_empty() {
                return Err(invalid(format!("action {} has no url", index + 1)));
            }
            if http.method.is_empty() {
                return Err(invalid(format!("action {} has no method", index + 1)));
            }
            if reqwest::Method::from_bytes(http.method.to_uppercase().as_bytes()).is_err() {
                return Err(invalid(format!(
                    "action {} has an invalid method: {}",
                    index + 1,
                    http.method
                )));
            }
            // Urls with placeholders can only be checked once substituted.
            if !http.url.contains("${") {
                match Url::parse(&http.url) {
                    Ok(url) if url.scheme() == "http" || url.scheme() == "https" => (),
                    Ok(url) => {
                        return Err(invalid(format!(
                            "action {} has an unsupported url scheme: {}",
                            index + 1,
                            url.scheme()
                        )))
                    }
                    Err(e) => {
                        return Err(invalid(format!(
                            "action {} has an invalid url {}: {}",
                            index + 1,
                            http.url,
                            e
                        )))
                    }
                }
            }
            if let Some(response) = http.response.as_ref() {
                response.validate(index)?;
            }
        }

        if let Some(tcp) = self.tcp.as_ref() {
            if tcp.address.is_empty() {
                return Err(invalid(format!("action {} has no address", index + 1)));
            }
        }

        Ok(())
    }
}

impl ResponseSpec {
    /// The kind and expression to compile.
    pub fn expression(&self) -> Option<(ExtractorKind, &str)> {
        match (self.jsonpath.as_ref(), self.xmlpath.as_ref()) {
            (Some(jsonpath), None) => Some((ExtractorKind::JsonPath, jsonpath)),
            (None, Some(xmlpath)) => Some((ExtractorKind::XmlPath, xmlpath)),
            _ => None,
        }
    }

    fn validate(&self, index: usize) -> Result<(), StampedeError> {
        let (kind, expression) = match self.expression() {
            Some(expression) => expression,
            None => {
                return Err(invalid(format!(
                    "response handler of action {} must define exactly one of jsonpath or xmlpath",
                    index + 1
                )))
            }
        };
        if self.variable.is_empty() {
            return Err(invalid(format!(
                "response handler of action {} has no variable",
                index + 1
            )));
        }
        // Malformed expressions are a configuration error.
        Extractor::compile(kind, expression)?;
        Ok(())
    }
}

impl TestPlan {
    /// Decode a test plan from YAML.
    pub fn from_yaml(yaml: &str) -> Result<TestPlan, StampedeError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and decode a test plan file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<TestPlan, StampedeError> {
        let path = path.as_ref();
        info!("loading test plan from {}", path.display());
        let yaml = std::fs::read_to_string(path)?;
        TestPlan::from_yaml(&yaml)
    }

    /// Confirm the plan can be run.
    pub fn validate(&self) -> Result<(), StampedeError> {
        if self.users == 0 {
            return Err(invalid("`users` must be set to at least 1".to_string()));
        }
        if self.iterations == 0 {
            return Err(invalid("`iterations` must be set to at least 1".to_string()));
        }
        if !self.rampup.is_finite() || self.rampup < 0.0 {
            return Err(invalid(format!(
                "`rampup` must be 0 or more seconds, not {}",
                self.rampup
            )));
        }
        // Stagger and pacing must fit in a sleep.
        if Duration::try_from_secs_f64(self.stagger()).is_err()
            || Duration::try_from_secs_f64(self.pacing()).is_err()
        {
            return Err(invalid(format!(
                "`rampup` of {} seconds is out of range for {} users",
                self.rampup, self.users
            )));
        }
        if self.concurrency == Some(0) {
            return Err(invalid("`concurrency` must be set to at least 1".to_string()));
        }
        if self.actions.is_empty() {
            return Err(invalid("at least one action must be defined".to_string()));
        }
        for (index, action) in self.actions.iter().enumerate() {
            action.validate(index)?;
        }
        if let Some(feeder) = self.feeder.as_ref() {
            if feeder.kind != "csv" {
                return Err(invalid(format!(
                    "unsupported feeder type: {}",
                    feeder.kind
                )));
            }
            if feeder.filename.is_empty() {
                return Err(invalid("feeder has no filename".to_string()));
            }
        }
        Ok(())
    }

    /// Validate the plan and build the executable action list.
    pub fn build_actions(&self) -> Result<Vec<Action>, StampedeError> {
        self.validate()?;
        self.actions.iter().map(Action::from_spec).collect()
    }

    /// Seconds between the start of successive users.
    pub fn stagger(&self) -> f64 {
        if self.rampup > 0.0 {
            self.rampup / self.users as f64
        } else {
            0.0
        }
    }

    /// Seconds each user pauses between iterations.
    pub fn pacing(&self) -> f64 {
        if self.rampup > 0.0 {
            self.users as f64 / self.rampup * self.actions.len() as f64
        } else {
            0.0
        }
    }

    /// How many outcome records a complete run produces.
    pub fn expected_records(&self) -> usize {
        self.users * self.iterations * self.actions.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PLAN: &str = r#"
users: 5
rampup: 10
iterations: 3
rate: 20
feeder:
  type: csv
  filename: accounts.csv
  delimiter: ";"
actions:
  - http:
      title: Index
      method: GET
      url: http://localhost:8080/
      headers:
        X-Test: "${UID}"
      response:
        jsonpath: $.ids[*]
        variable: id
        index: last
  - https:
      title: Item
      method: post
      url: https://localhost:8443/item/${id}
      template: '{"id": "${id}"}'
      store_cookie: SESSION
  - tcp:
      title: Ping
      address: localhost:9000
      payload: PING
      read_response: true
"#;

    #[test]
    fn decode_plan() {
        let plan = TestPlan::from_yaml(PLAN).unwrap();
        assert_eq!(plan.users, 5);
        assert_eq!(plan.rampup, 10.0);
        assert_eq!(plan.iterations, 3);
        assert_eq!(plan.rate, 20);
        assert_eq!(plan.actions.len(), 3);
        assert_eq!(plan.expected_records(), 45);

        let feeder = plan.feeder.as_ref().unwrap();
        assert_eq!(feeder.kind, "csv");
        assert_eq!(feeder.delimiter(), b';');

        let http = plan.actions[0].http.as_ref().unwrap();
        assert_eq!(http.headers.get("X-Test"), Some(&"${UID}".to_string()));
        let response = http.response.as_ref().unwrap();
        assert_eq!(response.index, Selection::Last);
        assert_eq!(response.variable, "id");

        assert_eq!(plan.actions[1].title(), "Item");
        assert!(plan.actions[2].tcp.as_ref().unwrap().read_response);

        plan.validate().unwrap();
        let actions = plan.build_actions().unwrap();
        assert_eq!(actions.len(), 3);
    }

    #[test]
    fn stagger_and_pacing() {
        let mut plan = TestPlan::from_yaml(PLAN).unwrap();
        assert_eq!(plan.stagger(), 2.0);
        assert_eq!(plan.pacing(), 1.5);

        plan.rampup = 0.0;
        assert_eq!(plan.stagger(), 0.0);
        assert_eq!(plan.pacing(), 0.0);
    }

    #[test]
    fn invalid_plans() {
        let valid = TestPlan::from_yaml(PLAN).unwrap();

        let mut plan = valid.clone();
        plan.users = 0;
        assert!(matches!(plan.validate(), Err(StampedeError::InvalidPlan { .. })));

        let mut plan = valid.clone();
        plan.iterations = 0;
        assert!(plan.validate().is_err());

        let mut plan = valid.clone();
        plan.rampup = -1.0;
        assert!(plan.validate().is_err());

        // Stagger too long to sleep.
        let mut plan = valid.clone();
        plan.rampup = 1e20;
        assert!(matches!(plan.validate(), Err(StampedeError::InvalidPlan { .. })));

        // Pacing too long to sleep.
        let mut plan = valid.clone();
        plan.rampup = 1e-320;
        assert!(plan.validate().is_err());

        let mut plan = valid.clone();
        plan.actions.clear();
        assert!(plan.validate().is_err());

        // Two protocols in one action.
        let mut plan = valid.clone();
        plan.actions[0].tcp = plan.actions[2].tcp.clone();
        assert!(plan.validate().is_err());

        let mut plan = valid.clone();
        plan.actions[2].tcp.as_mut().unwrap().address = String::new();
        assert!(plan.validate().is_err());

        let mut plan = valid.clone();
        plan.actions[0].http.as_mut().unwrap().method = "NOT A METHOD".to_string();
        assert!(plan.validate().is_err());

        let mut plan = valid.clone();
        plan.actions[0].http.as_mut().unwrap().url = "localhost/login".to_string();
        assert!(plan.validate().is_err());

        let mut plan = valid.clone();
        plan.actions[0].http.as_mut().unwrap().url = "ftp://localhost/login".to_string();
        assert!(plan.validate().is_err());

        // Placeholders are resolved later.
        let mut plan = valid.clone();
        plan.actions[0].http.as_mut().unwrap().url = "${base}/login".to_string();
        assert!(plan.validate().is_ok());

        let mut plan = valid.clone();
        plan.feeder.as_mut().unwrap().kind = "xls".to_string();
        assert!(plan.validate().is_err());

        // A malformed expression is reported before the run.
        let mut plan = valid.clone();
        plan.actions[0]
            .http
            .as_mut()
            .unwrap()
            .response
            .as_mut()
            .unwrap()
            .jsonpath = Some("$[".to_string());
        assert!(matches!(
            plan.validate(),
            Err(StampedeError::InvalidExpression { .. })
        ));

        let mut plan = valid;
        plan.actions[0]
            .http
            .as_mut()
            .unwrap()
            .response
            .as_mut()
            .unwrap()
            .xmlpath = Some("/a".to_string());
        assert!(plan.validate().is_err());
    }

    #[test]
    fn malformed_yaml() {
        assert!(matches!(
            TestPlan::from_yaml("users: [1, 2"),
            Err(StampedeError::Yaml(_))
        ));
        // Missing required fields.
        assert!(TestPlan::from_yaml("users: 1").is_err());
    }
}
