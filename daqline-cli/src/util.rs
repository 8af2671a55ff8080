use std::fmt::Display;
use std::str::FromStr;

use anyhow::{Error, Result};
use clap::ArgMatches;

use daqline_core::{Event, EventBody, Registry};

/// Parses the value of a command line argument.
pub(crate) fn parse_arg<T>(matches: &ArgMatches, name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let value = matches
        .value_of(name)
        .ok_or(Error::msg(format!("missing value for `{}`", name)))?;
    value
        .parse()
        .map_err(|e| Error::msg(format!("invalid value for `{}` ({}): {}", name, value, e)))
}

/// Formats an event as one line per event, children indented below their
/// packet.
pub(crate) fn format_event(event: &Event, registry: &Registry, depth: usize) -> String {
    let mnemonic = registry.mnemonic(event.type_id()).unwrap_or("?");
    let mut line = format!(
        "{:indent$}{} run {} event {}",
        "",
        mnemonic,
        event.run_n(),
        event.event_n(),
        indent = depth * 2
    );
    if event.is_bore() {
        line.push_str(" BORE");
    }
    if event.is_eore() {
        line.push_str(" EORE");
    }
    match (event.timestamp_begin(), event.timestamp_end()) {
        (Some(begin), Some(end)) => line.push_str(&format!(" ts [{}, {})", begin, end)),
        (Some(begin), None) => line.push_str(&format!(" ts {}", begin)),
        _ => (),
    }
    match event.body() {
        EventBody::Raw(raw) => {
            let bytes: usize = raw.blocks().iter().map(|(_, b)| b.len()).sum();
            line.push_str(&format!(" {} block(s) {} byte(s)", raw.blocks().len(), bytes));
        }
        EventBody::Trigger(trigger) => line.push_str(&format!(" trigger {}", trigger.trigger_n)),
        _ => (),
    }
    for (key, value) in event.tags() {
        line.push_str(&format!(" {}={}", key, value));
    }
    for child in event.children() {
        line.push('\n');
        line.push_str(&format_event(child, registry, depth + 1));
    }
    line
}

#[test]
fn packets_list_their_children() {
    let registry = Registry::with_builtins();
    let mut packet = Event::packet();
    packet.set_event_n(3);
    packet.set_tag("ALIGNMENT", "MATCHED");
    let mut trigger = Event::trigger(7);
    trigger.set_timestamp(100, 101);
    packet.add_child(trigger);
    packet.add_child(Event::raw("plane"));

    let text = format_event(&packet, &registry, 0);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("PACKET run 0 event 3"));
    assert!(lines[0].ends_with("ALIGNMENT=MATCHED"));
    assert_eq!(lines[1], "  TRIGGER run 0 event 0 ts [100, 101) trigger 7");
    assert!(lines[2].starts_with("  RAW"));
}
