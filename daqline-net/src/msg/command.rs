use std::fmt::{Display, Formatter};
use std::str::FromStr;

use daqline_core::Configuration;

use crate::{Error, Result};

/// Command sent by run control to nodes.
///
/// Text form is `VERB[:ARG]`. Every verb takes a fixed number of arguments
/// and the last one extends to the end of the text, so configuration text
/// and addresses can contain `:` freely.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Initialise(Configuration),
    Configure(Configuration),
    Start(u32),
    Stop,
    Reset,
    Terminate,
    /// Push status right away
    Status,
    /// Connect the data path to the collector at the given address
    Data(String),
    /// Forward log records to the log collector at the given address
    Log(String),
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Initialise(_) => "INITIALISE",
            Self::Configure(_) => "CONFIGURE",
            Self::Start(_) => "START",
            Self::Stop => "STOP",
            Self::Reset => "RESET",
            Self::Terminate => "TERMINATE",
            Self::Status => "STATUS",
            Self::Data(_) => "DATA",
            Self::Log(_) => "LOG",
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialise(config) | Self::Configure(config) => {
                write!(f, "{}:{}", self.verb(), config)
            }
            Self::Start(run_n) => write!(f, "{}:{}", self.verb(), run_n),
            Self::Data(addr) | Self::Log(addr) => write!(f, "{}:{}", self.verb(), addr),
            _ => write!(f, "{}", self.verb()),
        }
    }
}

impl FromStr for Command {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let (verb, arg) = match s.find(':') {
            Some(pos) => (&s[..pos], Some(&s[pos + 1..])),
            None => (s, None),
        };
        let command = match (verb, arg) {
            ("INITIALISE", arg) => Self::Initialise(parse_config(arg.unwrap_or(""))?),
            ("CONFIGURE", arg) => Self::Configure(parse_config(arg.unwrap_or(""))?),
            ("START", Some(arg)) => Self::Start(
                arg.trim()
                    .parse()
                    .map_err(|_| Error::InvalidCommand(format!("bad run number: {}", arg)))?,
            ),
            ("DATA", Some(arg)) if !arg.is_empty() => Self::Data(arg.to_string()),
            ("LOG", Some(arg)) if !arg.is_empty() => Self::Log(arg.to_string()),
            ("STOP", None) => Self::Stop,
            ("RESET", None) => Self::Reset,
            ("TERMINATE", None) => Self::Terminate,
            ("STATUS", None) => Self::Status,
            ("START", None) | ("DATA", _) | ("LOG", _) => {
                return Err(Error::InvalidCommand(format!("{}: missing argument", verb)))
            }
            ("STOP", Some(_)) | ("RESET", Some(_)) | ("TERMINATE", Some(_)) | ("STATUS", Some(_)) => {
                return Err(Error::InvalidCommand(format!("{}: takes no argument", verb)))
            }
            _ => return Err(Error::InvalidCommand(s.chars().take(64).collect())),
        };
        Ok(command)
    }
}

fn parse_config(text: &str) -> Result<Configuration> {
    text.parse()
        .map_err(|e| Error::InvalidCommand(format!("bad configuration: {}", e)))
}

#[test]
fn command_grammar() {
    assert_eq!("STOP".parse::<Command>().unwrap(), Command::Stop);
    assert_eq!("START:12".parse::<Command>().unwrap(), Command::Start(12));
    assert_eq!(
        "DATA:tcp://10.0.0.2:44001".parse::<Command>().unwrap(),
        Command::Data("tcp://10.0.0.2:44001".to_string())
    );
    assert_eq!(
        "LOG:tcp://10.0.0.3:44002".parse::<Command>().unwrap(),
        Command::Log("tcp://10.0.0.3:44002".to_string())
    );
    assert!("LOG".parse::<Command>().is_err());
    assert!("START".parse::<Command>().is_err());
    assert!("START:x".parse::<Command>().is_err());
    assert!("STOP:now".parse::<Command>().is_err());
    assert!("stop".parse::<Command>().is_err());
    assert!("LAUNCH:1".parse::<Command>().is_err());
}

#[test]
fn configuration_text_may_contain_colons() {
    let mut config = Configuration::new();
    config.set("Name", "run: with colons");
    config.set_section("DataCollector.dc");
    config.set("FilePattern", "data:run$6R$X");
    let text = Command::Configure(config.clone()).to_string();
    assert!(text.starts_with("CONFIGURE:"));

    match text.parse::<Command>().unwrap() {
        Command::Configure(parsed) => {
            assert_eq!(parsed.name(), "run: with colons");
            let view = parsed.for_section("DataCollector.dc");
            assert_eq!(view.get_str("FilePattern", ""), "data:run$6R$X");
        }
        other => panic!("expected configure, got {:?}", other),
    }
    assert_eq!(
        "INITIALISE".parse::<Command>().unwrap(),
        Command::Initialise(Configuration::new())
    );
}
