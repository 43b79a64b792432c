//! Interactive REPL-style command-line interface client.

use std::io::{self, Write};
use std::str::SplitWhitespace;

use color_print::{cprint, cprintln};

use tokio::time::Instant;

use shardkv::{Clerk, ShardKvError};

/// Prompt string at the start of line.
const PROMPT: &str = ">>>>> ";

/// Recognizable command types.
#[derive(Debug, PartialEq, Eq)]
enum ReplCommand {
    /// Read a key.
    Get { key: String },

    /// Replace the value of a key.
    Put { key: String, value: String },

    /// Append to the value of a key.
    Append { key: String, value: String },

    /// Print help message.
    PrintHelp,

    /// Client exit.
    Exit,

    /// Nothing read.
    Nothing,
}

/// Interactive REPL-style client struct.
pub struct ClientRepl {
    /// Clerk issuing all requests.
    clerk: Clerk,

    /// User input buffer.
    input_buf: String,
}

impl ClientRepl {
    /// Creates a new REPL-style client.
    pub fn new(clerk: Clerk) -> Self {
        ClientRepl {
            clerk,
            input_buf: String::new(),
        }
    }

    /// Prints the prompt string.
    #[inline]
    fn print_prompt() -> Result<(), ShardKvError> {
        cprint!("<bright-yellow>{}</>", PROMPT);
        io::stdout().flush()?;
        Ok(())
    }

    /// Prints (optionally) an error message and the help message.
    fn print_help(err: Option<&ShardKvError>) {
        if let Some(e) = err {
            cprintln!("<bright-red>✗</> {}", e);
        }
        println!("HELP: Supported commands are:");
        println!("          get <key>");
        println!("          put <key> <value>");
        println!("          append <key> <value>");
        println!("          help");
        println!("          exit");
        println!(
            "      Keys and values currently cannot contain any whitespaces"
        );
    }

    /// Expect to get the next segment string from parsed segs.
    #[inline]
    fn expect_next_seg<'s>(
        segs: &mut SplitWhitespace<'s>,
    ) -> Result<&'s str, ShardKvError> {
        segs.next()
            .ok_or_else(|| ShardKvError::msg("not enough args"))
    }

    /// Parses one input line into a command.
    fn parse_command(line: &str) -> Result<ReplCommand, ShardKvError> {
        // split input line by whitespaces, getting an iterator of segments
        let mut segs = line.split_whitespace();

        // get command type, match case-insensitively
        let Some(cmd_type) = segs.next() else {
            return Ok(ReplCommand::Nothing);
        };

        match &cmd_type.to_lowercase()[..] {
            "get" => {
                // keys are kept as-is, no case conversions
                let key = Self::expect_next_seg(&mut segs)?;
                Ok(ReplCommand::Get { key: key.into() })
            }

            "put" => {
                // keys and values are kept as-is, no case conversions
                let key = Self::expect_next_seg(&mut segs)?;
                let value = Self::expect_next_seg(&mut segs)?;
                Ok(ReplCommand::Put {
                    key: key.into(),
                    value: value.into(),
                })
            }

            "append" => {
                let key = Self::expect_next_seg(&mut segs)?;
                let value = Self::expect_next_seg(&mut segs)?;
                Ok(ReplCommand::Append {
                    key: key.into(),
                    value: value.into(),
                })
            }

            "help" => Ok(ReplCommand::PrintHelp),

            "exit" => Ok(ReplCommand::Exit),

            _ => Err(ShardKvError(format!(
                "unrecognized command: {}",
                cmd_type
            ))),
        }
    }

    /// Reads in user input and parses into a command.
    fn read_command(&mut self) -> Result<ReplCommand, ShardKvError> {
        self.input_buf.clear();
        let nread = io::stdin().read_line(&mut self.input_buf)?;
        if nread == 0 {
            return Ok(ReplCommand::Exit);
        }
        Self::parse_command(&self.input_buf)
    }

    /// Issues the command through the clerk and prints the outcome.
    async fn eval_command(&mut self, cmd: ReplCommand) {
        let start = Instant::now();
        let (label, result) = match cmd {
            ReplCommand::Get { key } => ("value", self.clerk.get(&key).await),
            ReplCommand::Put { key, value } => {
                ("old", Ok(self.clerk.put(&key, &value).await))
            }
            ReplCommand::Append { key, value } => {
                ("old", Ok(self.clerk.append(&key, &value).await))
            }
            _ => return,
        };
        let lat_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(value) => {
                cprintln!(
                    "<bright-green>✓</> {} {:?} <<took {:.2} ms>>",
                    label,
                    value,
                    lat_ms
                );
            }
            Err(e) => {
                cprintln!("<bright-red>✗</> {}", e);
            }
        }
    }

    /// One iteration of the REPL loop.
    async fn iter(&mut self) -> Result<bool, ShardKvError> {
        Self::print_prompt()?;

        let cmd = match self.read_command() {
            Ok(cmd) => cmd,
            Err(e) => {
                Self::print_help(Some(&e));
                return Ok(true);
            }
        };
        match cmd {
            ReplCommand::Exit => {
                println!("Exiting...");
                Ok(false)
            }

            ReplCommand::Nothing => Ok(true),

            ReplCommand::PrintHelp => {
                Self::print_help(None);
                Ok(true)
            }

            cmd => {
                self.eval_command(cmd).await;
                Ok(true)
            }
        }
    }

    /// Runs the REPL loop until exit or end of input.
    pub async fn run(&mut self) -> Result<(), ShardKvError> {
        while self.iter().await? {}
        Ok(())
    }
}
