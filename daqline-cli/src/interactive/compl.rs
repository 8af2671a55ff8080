use linefeed::complete::{Completer, Completion, PathCompleter};
use linefeed::terminal::Terminal;
use linefeed::Prompter;

use super::APP_COMMANDS;

pub struct MainCompleter;

impl<Term: Terminal> Completer<Term> for MainCompleter {
    fn complete(
        &self,
        word: &str,
        prompter: &Prompter<Term>,
        start: usize,
        end: usize,
    ) -> Option<Vec<Completion>> {
        let line = prompter.buffer();
        let mut words = line[..start].split_whitespace();

        match words.next() {
            // Complete command name
            None => {
                let mut compls = Vec::new();
                for &(cmd, _) in APP_COMMANDS {
                    if cmd.starts_with(word) {
                        compls.push(Completion::simple(cmd.to_owned()));
                    }
                }
                Some(compls)
            }
            // Complete config file paths
            Some("init") | Some("config") if words.next().is_none() => {
                PathCompleter.complete(word, prompter, start, end)
            }
            _ => None,
        }
    }
}
