//! Interactive menu for the client binary.

use std::io::{self, BufRead, Write};

use crate::protocol::Direction;

/// One transfer the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub filename: String,
    pub direction: Direction,
}

/// Line-oriented prompts over any reader and writer. End of input always
/// means "quit".
pub struct Menu<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Menu<R, W> {
    pub fn new(input: R, output: W) -> Menu<R, W> {
        Menu { input, output }
    }

    /// Ask for a filename and a direction.
    pub fn next_request(&mut self) -> io::Result<Option<Request>> {
        let filename = match self.ask("Enter Filename: ")? {
            Some(name) => name,
            None => return Ok(None),
        };

        loop {
            let answer = match self.ask("Send file to server (1) or Retrieve file from server (2): ")? {
                Some(answer) => answer,
                None => return Ok(None),
            };
            let direction = match answer.as_str() {
                "1" => Direction::Write,
                "2" => Direction::Read,
                _ => {
                    self.say("Please select 1 or 2!")?;
                    continue;
                }
            };
            return Ok(Some(Request {
                filename,
                direction,
            }));
        }
    }

    /// Ask whether to go on. Only an explicit "y" continues.
    pub fn confirm_continue(&mut self) -> io::Result<bool> {
        loop {
            match self.ask("Continue? (y/n): ")? {
                None => return Ok(false),
                Some(answer) if answer.eq_ignore_ascii_case("y") => return Ok(true),
                Some(answer) if answer.eq_ignore_ascii_case("n") => return Ok(false),
                Some(_) => self.say("Invalid Option!")?,
            }
        }
    }

    pub fn say(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.output, "{line}")?;
        self.output.flush()
    }

    /// Print `prompt` and read the next non-blank line, trimmed.
    fn ask(&mut self, prompt: &str) -> io::Result<Option<String>> {
        loop {
            write!(self.output, "{prompt}")?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let answer = line.trim();
            if !answer.is_empty() {
                return Ok(Some(answer.to_string()));
            }
        }
    }
}
