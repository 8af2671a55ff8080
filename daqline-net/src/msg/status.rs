use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use super::NodeState;
use crate::{Error, Result};

/// Run number the status refers to.
pub const TAG_RUN: &str = "RUN";
/// Number of events handled in the current run.
pub const TAG_EVENT: &str = "EVENT";
/// Bytes written to the current file.
pub const TAG_FILEBYTES: &str = "FILEBYTES";
/// Data listen address of a collector.
pub const TAG_SERVER: &str = "_SERVER";
/// Collectors a producer lost its data connection to.
pub const TAG_DATA_LOST: &str = "DATALOST";

const ERROR_KEY: &str = "ERROR";

/// Status pushed by a node.
///
/// Text form is `STATE[;KEY=VALUE]*[;ERROR=text]`, the error text running
/// to the end of the message.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub state: NodeState,
    tags: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl Status {
    pub fn new(state: NodeState) -> Self {
        Self {
            state,
            tags: BTreeMap::new(),
            error: None,
        }
    }

    pub fn with_error(state: NodeState, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(state)
        }
    }

    /// Sets a tag. Separators in the value are replaced with `,`.
    pub fn set_tag<V: ToString>(&mut self, key: &str, value: V) {
        self.tags
            .insert(key.to_string(), value.to_string().replace(';', ","));
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|v| v.as_str())
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Run number from the `RUN` tag.
    pub fn run_n(&self) -> Option<u32> {
        self.tag(TAG_RUN).and_then(|r| r.parse().ok())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.state)?;
        for (key, value) in &self.tags {
            write!(f, ";{}={}", key, value)?;
        }
        if let Some(error) = &self.error {
            write!(f, ";{}={}", ERROR_KEY, error)?;
        }
        Ok(())
    }
}

impl FromStr for Status {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let marker = format!(";{}=", ERROR_KEY);
        let (head, error) = match s.find(&marker) {
            Some(pos) => (&s[..pos], Some(s[pos + marker.len()..].to_string())),
            None => (s, None),
        };
        let mut parts = head.split(';');
        let state = parts.next().unwrap_or("").parse()?;
        let mut status = Status::new(state);
        status.error = error;
        for part in parts {
            let mut kv = part.splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some(key), Some(value)) if !key.is_empty() => {
                    status.tags.insert(key.to_string(), value.to_string());
                }
                _ => return Err(Error::InvalidStatus(format!("bad tag: {}", part))),
            }
        }
        Ok(status)
    }
}

#[test]
fn status_grammar() {
    let status: Status = "RUNNING;EVENT=120;RUN=4".parse().unwrap();
    assert_eq!(status.state, NodeState::Running);
    assert_eq!(status.run_n(), Some(4));
    assert_eq!(status.tag(TAG_EVENT), Some("120"));
    assert_eq!(status.error, None);

    let status: Status = "ERROR;RUN=2;ERROR=disk full; cannot write=now"
        .parse()
        .unwrap();
    assert_eq!(status.state, NodeState::Error);
    assert_eq!(status.error.as_deref(), Some("disk full; cannot write=now"));
    assert_eq!(status.tags().len(), 1);

    assert!("BUSY".parse::<Status>().is_err());
    assert!("RUNNING;EVENT".parse::<Status>().is_err());
}

#[test]
fn tag_values_cannot_break_the_grammar() {
    let mut status = Status::with_error(NodeState::Configured, "oops");
    status.set_tag(TAG_SERVER, "tcp://127.0.0.1:4000");
    status.set_tag("NOTE", "a;b");
    let text = status.to_string();
    assert_eq!(
        text,
        "CONFIGURED;NOTE=a,b;_SERVER=tcp://127.0.0.1:4000;ERROR=oops"
    );
    assert_eq!(text.parse::<Status>().unwrap(), status);
}
